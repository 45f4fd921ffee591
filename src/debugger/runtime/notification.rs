use strum_macros::Display;

/// Notification codes sent by a managed runtime through its notification function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum NotificationKind {
    InitializeManagedCode,
    InitializeCorlib,
    JitBreakpoint,
    InitializeThreadManager,
    AcquireGlobalThreadLock,
    ReleaseGlobalThreadLock,
    WrapperMain,
    MainExited,
    UnhandledException,
    ThrowException,
    HandleException,
    ThreadCreated,
    ThreadCleanup,
    GcThreadCreated,
    GcThreadExited,
    ReachedMain,
    FinalizeManagedCode,
    LoadModule,
    UnloadModule,
    DomainCreate,
    DomainUnload,
    ClassInitialized,
    InterruptionRequest,
    Trampoline,
    Unknown(u64),
}

impl From<u64> for NotificationKind {
    fn from(code: u64) -> Self {
        match code {
            1 => NotificationKind::InitializeManagedCode,
            2 => NotificationKind::InitializeCorlib,
            3 => NotificationKind::JitBreakpoint,
            4 => NotificationKind::InitializeThreadManager,
            5 => NotificationKind::AcquireGlobalThreadLock,
            6 => NotificationKind::ReleaseGlobalThreadLock,
            7 => NotificationKind::WrapperMain,
            8 => NotificationKind::MainExited,
            9 => NotificationKind::UnhandledException,
            10 => NotificationKind::ThrowException,
            11 => NotificationKind::HandleException,
            12 => NotificationKind::ThreadCreated,
            13 => NotificationKind::ThreadCleanup,
            14 => NotificationKind::GcThreadCreated,
            15 => NotificationKind::GcThreadExited,
            16 => NotificationKind::ReachedMain,
            17 => NotificationKind::FinalizeManagedCode,
            18 => NotificationKind::LoadModule,
            19 => NotificationKind::UnloadModule,
            20 => NotificationKind::DomainCreate,
            21 => NotificationKind::DomainUnload,
            22 => NotificationKind::ClassInitialized,
            23 => NotificationKind::InterruptionRequest,
            256 => NotificationKind::Trampoline,
            code => NotificationKind::Unknown(code),
        }
    }
}

impl NotificationKind {
    pub fn code(self) -> u64 {
        match self {
            NotificationKind::InitializeManagedCode => 1,
            NotificationKind::InitializeCorlib => 2,
            NotificationKind::JitBreakpoint => 3,
            NotificationKind::InitializeThreadManager => 4,
            NotificationKind::AcquireGlobalThreadLock => 5,
            NotificationKind::ReleaseGlobalThreadLock => 6,
            NotificationKind::WrapperMain => 7,
            NotificationKind::MainExited => 8,
            NotificationKind::UnhandledException => 9,
            NotificationKind::ThrowException => 10,
            NotificationKind::HandleException => 11,
            NotificationKind::ThreadCreated => 12,
            NotificationKind::ThreadCleanup => 13,
            NotificationKind::GcThreadCreated => 14,
            NotificationKind::GcThreadExited => 15,
            NotificationKind::ReachedMain => 16,
            NotificationKind::FinalizeManagedCode => 17,
            NotificationKind::LoadModule => 18,
            NotificationKind::UnloadModule => 19,
            NotificationKind::DomainCreate => 20,
            NotificationKind::DomainUnload => 21,
            NotificationKind::ClassInitialized => 22,
            NotificationKind::InterruptionRequest => 23,
            NotificationKind::Trampoline => 256,
            NotificationKind::Unknown(code) => code,
        }
    }
}

use clap::{Parser, ValueEnum};
use console_sdk::{Principal, PrincipalKind, ThreadId};

/// Console-level info plus the sync drivers' lifecycle at debug.
pub const DEFAULT_LOG_FILTER: &str = "info,sync=debug";

#[derive(Parser, Debug)]
#[command(
    name = "console-sync",
    about = "Follow the recruiting console's chats and calendar from the terminal",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "CONSOLE_BASE_URL",
        default_value = "http://localhost:8000/api",
        help = "Base URL of the console REST API"
    )]
    pub base_url: String,

    #[arg(
        long,
        env = "CONSOLE_PUSH_URL",
        value_name = "URL",
        help = "Calendar push socket (ws:// or wss://); live calendar updates are off when unset"
    )]
    pub push_url: Option<String>,

    #[arg(long, env = "CONSOLE_TOKEN", hide_env_values = true, help = "Bearer token")]
    pub token: Option<String>,

    #[arg(
        long = "as",
        value_enum,
        env = "CONSOLE_PRINCIPAL_KIND",
        default_value_t = PrincipalArg::Recruiter,
        help = "Kind of the signed-in principal"
    )]
    pub principal_kind: PrincipalArg,

    #[arg(long = "id", env = "CONSOLE_PRINCIPAL_ID", help = "Id of the signed-in principal")]
    pub principal_id: i64,

    #[arg(long, value_name = "THREAD_ID", help = "Open this thread right away")]
    pub thread: Option<ThreadId>,

    #[arg(long, help = "Bind the calendar push channel")]
    pub calendar: bool,

    #[arg(long, help = "Print Prometheus counters on exit")]
    pub metrics: bool,

    #[arg(
        long,
        env = "RUST_LOG",
        default_value = DEFAULT_LOG_FILTER,
        help = "tracing filter directive"
    )]
    pub log_filter: String,
}

impl Cli {
    pub fn principal(&self) -> Principal {
        Principal::new(self.principal_kind.into(), self.principal_id)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalArg {
    User,
    Recruiter,
    Candidate,
}

impl From<PrincipalArg> for PrincipalKind {
    fn from(value: PrincipalArg) -> Self {
        match value {
            PrincipalArg::User => PrincipalKind::User,
            PrincipalArg::Recruiter => PrincipalKind::Recruiter,
            PrincipalArg::Candidate => PrincipalKind::Candidate,
        }
    }
}

use clap::{Parser, Subcommand, ValueEnum};
use council_sync::{SessionId, SyncConfig, Transition, VoteType};

#[derive(Parser, Debug)]
#[command(name = "council-live")]
#[command(about = "Follow and drive a live council session")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// STOMP WebSocket endpoint (e.g., ws://localhost:8080/ws/websocket)
    #[arg(long, global = true, env = "COUNCIL_WS_URL")]
    pub ws_url: Option<String>,

    /// REST API base URL (e.g., http://localhost:8080/api)
    #[arg(long, global = true, env = "COUNCIL_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token for the API and the STOMP handshake
    #[arg(long, global = true, env = "COUNCIL_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Print Prometheus metrics to stdout before exiting
    #[arg(long, global = true)]
    pub print_metrics: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream tallies, presenter focus and notices until interrupted
    Watch {
        session: SessionId,

        /// Also follow the amendments of these topics
        #[arg(long = "amendments-of", value_name = "TOPIC")]
        amendments_of: Vec<u64>,
    },

    /// Cast (or change) your vote on a topic or one of its amendments
    Vote {
        session: SessionId,

        #[arg(long)]
        topic: u64,

        /// Vote on this amendment of the topic instead
        #[arg(long)]
        amendment: Option<u64>,

        /// YES, NO, ABSTAINED, CANNOT_VOTE or HAVE_NOT_VOTED
        vote: VoteType,
    },

    /// Move a topic or amendment through its voting lifecycle
    Transition {
        session: SessionId,

        action: Action,

        #[arg(long)]
        topic: u64,

        #[arg(long)]
        amendment: Option<u64>,
    },

    /// Point the presenter display at a topic
    Present { session: SessionId, topic: u64 },

    /// Tell other clients to refetch
    Announce { session: SessionId, kind: Announcement },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Action {
    Start,
    Finish,
    Restart,
    Information,
    Withdraw,
}

impl From<Action> for Transition {
    fn from(action: Action) -> Self {
        match action {
            Action::Start => Transition::Start,
            Action::Finish => Transition::Finish,
            Action::Restart => Transition::Restart,
            Action::Information => Transition::MarkInformation,
            Action::Withdraw => Transition::Withdraw,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Announcement {
    Topic,
    Amendment,
}

impl Cli {
    /// Flags win over whatever `SyncConfig::from_env` found.
    pub fn apply(&self, config: &mut SyncConfig) {
        if let Some(url) = &self.ws_url {
            config.ws_url = url.clone();
        }
        if let Some(url) = &self.api_url {
            config.api_url = url.clone();
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
    }
}

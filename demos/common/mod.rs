//! Pieces shared by the demo binaries.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mill_reactor::codec::Message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: i64,
    pub questioner: String,
    pub question: Vec<String>,
}

impl Message for Query {
    const TYPE_NAME: &'static str = "muduo.Query";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub id: i64,
    pub questioner: String,
    pub answerer: String,
    pub solution: Vec<String>,
}

impl Message for Answer {
    const TYPE_NAME: &'static str = "muduo.Answer";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {
    pub id: i32,
}

impl Message for Empty {
    const TYPE_NAME: &'static str = "muduo.Empty";
}

pub fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

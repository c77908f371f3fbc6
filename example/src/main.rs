use tracing::trace_span;
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use pgsession::Result;

mod connection;
mod query;
mod notify;
mod copy;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    trace_span!("connection").in_scope(connection::main)?;
    trace_span!("query").in_scope(query::main)?;
    trace_span!("notify").in_scope(notify::main)?;
    trace_span!("copy").in_scope(copy::main)?;

    Ok(())
}

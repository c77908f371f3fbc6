use std::env::var;

use pgsession::{Config, Result, Session, SessionState};

pub fn main() -> Result<()> {
    let url = var("DATABASE_URL").unwrap();

    let mut session = Session::connect(&url)?;
    assert_eq!(session.state(), SessionState::Open);
    tracing::info!(
        server_version = session.server_version(),
        backend = session.backendpid(),
        db = session.dbname()?,
        "connected",
    );
    session.close();
    assert_eq!(session.state(), SessionState::Closed);

    let mut session = Session::connect_env()?;
    session.exec("SELECT 1")?;
    drop(session);

    let config: Config = url.parse()?;
    let mut session = Session::lazy(config.set_application_name("pgsession-example"))?;
    assert_eq!(session.state(), SessionState::Unconnected);
    session.activate()?;
    assert_eq!(session.get_variable("application_name")?, "pgsession-example");

    session.set_variable("statement_timeout", "'5s'")?;
    assert_eq!(session.get_variable("statement_timeout")?, "5s");

    Ok(())
}

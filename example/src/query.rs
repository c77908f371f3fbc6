use pgsession::{ExecStatus, Result, Session, params};

pub fn main() -> Result<()> {
    let mut session = Session::connect_env()?;

    session.exec("CREATE TEMP TABLE post(id serial, title text, body text)")?;

    let title = session.quote("it's a title")?;
    let inserted = session.exec(&format!("INSERT INTO post(title) VALUES ({title})"))?;
    assert_eq!(inserted.rows_affected(), 1);

    let inserted = session.exec_params(
        "INSERT INTO post(title, body) VALUES ($1, $2), ($3, $4)",
        &params!["second", None::<&str>, "third", ""],
    )?;
    assert_eq!(inserted.rows_affected(), 2);

    let name = session.adorn_name("find_post");
    session.prepare(&name, "SELECT title, body FROM post WHERE id = $1")?;
    let post = session.exec_prepared(&name, &params![2])?;
    assert_eq!(post.text(0, 0)?, Some("second"));
    assert!(post.is_null(0, 1));
    session.unprepare(&name)?;

    let err = session.exec("SELECT * FROM no_such_table").unwrap_err();
    tracing::info!("expected failure: {}", err.kind());

    session.start_exec("SELECT count(*) FROM post; SELECT 1")?;
    while let Some(result) = session.get_result_checked()? {
        assert_eq!(result.status(), ExecStatus::TuplesOk);
    }

    Ok(())
}

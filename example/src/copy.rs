use pgsession::{Result, Session};

pub fn main() -> Result<()> {
    let mut session = Session::connect_env()?;

    session.exec("CREATE TEMP TABLE item(id int, name text)")?;

    session.exec("COPY item FROM STDIN")?;
    for (id, name) in [(1, "apple"), (2, "banana")] {
        session.write_copy_line(format!("{id}\t{name}"))?;
    }
    session.end_copy_write()?;

    session.exec("COPY item TO STDOUT")?;
    let mut line = vec![];
    let mut rows = vec![];
    while session.read_copy_line(&mut line)? {
        rows.push(String::from_utf8_lossy(&line).into_owned());
    }
    assert_eq!(rows, ["1\tapple\n", "2\tbanana\n"]);

    Ok(())
}

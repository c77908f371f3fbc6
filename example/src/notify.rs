use std::{cell::RefCell, rc::Rc, time::Duration};

use pgsession::{FnReceiver, Result, Session};

pub fn main() -> Result<()> {
    let mut listener = Session::connect_env()?;
    let mut notifier = Session::connect_env()?;

    let notices = Rc::new(RefCell::new(Vec::<String>::new()));
    let handler = {
        let notices = notices.clone();
        Rc::new(move |msg: &str| {
            notices.borrow_mut().push(msg.to_owned());
            true
        })
    };
    listener.register_errorhandler(&handler);

    let received = Rc::new(RefCell::new(Vec::<String>::new()));
    let receiver = {
        let received = received.clone();
        Rc::new(FnReceiver::new("pgsession_example", move |payload: &str, _| {
            received.borrow_mut().push(payload.to_owned());
            Ok(())
        }))
    };
    listener.add_receiver(&receiver)?;

    notifier.exec("NOTIFY pgsession_example, 'hello'")?;
    listener.await_notification_timeout(Duration::from_secs(5))?;
    assert_eq!(*received.borrow(), ["hello"]);

    listener.exec("DO $$ BEGIN RAISE NOTICE 'from the server'; END $$")?;
    assert!(notices.borrow().iter().any(|e| e.contains("from the server")));

    listener.remove_receiver(&receiver);
    listener.unregister_errorhandler(&handler);

    Ok(())
}

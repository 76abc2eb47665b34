//! A toy application built on `cmdserv`: a shared in-memory key/value
//! store reachable over a line protocol, plus a handful of introspection
//! commands. Demonstrates the library's public API; not part of it.
//!
//! Connect with e.g. `nc localhost 50000` and try:
//!
//! ```text
//! help
//! value set answer 42
//! value get answer
//! timeout 30
//! server status
//! exit
//! ```

use cmdserv::{Connection, Server, ServerConfig, Severity};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::cell::RefCell;
use std::time::Duration;

const HELP: &str = "\
commands:
  help                    show this text
  value get <key>         print a stored value
  value set <key> <val>   store a value
  timeout <secs>          set this connection's idle timeout (0 disables)
  parse <args...>         echo back how this line was tokenized
  server status           print the server status report
  server shutdown         close every connection and stop the server
  exit | quit | disconnect   close this connection";

fn main() -> io::Result<()> {
    env_logger::init();

    let mut config = ServerConfig::default();
    config.port = 50000;

    let mut server = Server::start(config)?;
    server.set_log_fn(cmdserv::severity::logger_log_crate);

    let store: Rc<RefCell<HashMap<String, String>>> = Rc::new(RefCell::new(HashMap::new()));
    let shutdown_requested = Rc::new(RefCell::new(false));

    server.set_open_handler(Box::new(|conn, reason| {
        if reason == cmdserv::CloseReason::ServerTooManyConnections {
            conn.send_status(591, "too many connections, try again later");
        } else {
            conn.send_status(220, "welcome to the cmdserv shell demo");
        }
    }));

    server.set_close_handler(Box::new(|conn| {
        conn.log(
            Severity::Info,
            &format!("closed: {:?}", conn.close_reason()),
        );
    }));

    {
        let store = Rc::clone(&store);
        let shutdown_requested = Rc::clone(&shutdown_requested);
        server.set_cmd_handler(Box::new(move |conn, argv| {
            dispatch(conn, argv, &store, &shutdown_requested);
        }));
    }

    loop {
        server.tick(Duration::from_millis(200))?;
        if *shutdown_requested.borrow() {
            break;
        }
    }

    server.shutdown();
    Ok(())
}

fn dispatch(
    conn: &mut Connection,
    argv: &[String],
    store: &Rc<RefCell<HashMap<String, String>>>,
    shutdown_requested: &Rc<RefCell<bool>>,
) {
    conn.log(Severity::Debug, &format!("> {}", Connection::command_string(argv)));

    let cmd = match argv.first() {
        Some(cmd) => cmd.as_str(),
        None => return,
    };

    match cmd {
        "help" => conn.println(HELP),
        "exit" | "quit" | "disconnect" => {
            conn.send_status(200, "bye");
            conn.close(cmdserv::CloseReason::ApplicationClose);
        }
        "value" => value_cmd(conn, &argv[1..], store),
        "timeout" => timeout_cmd(conn, &argv[1..]),
        "parse" => {
            conn.println(&Connection::command_string(&argv[1..]));
        }
        "server" => server_cmd(conn, &argv[1..], shutdown_requested),
        _ => conn.send_status(400, "unknown command, try \"help\""),
    }
}

fn value_cmd(conn: &mut Connection, args: &[String], store: &Rc<RefCell<HashMap<String, String>>>) {
    match args {
        [sub, key] if sub == "get" => match store.borrow().get(key) {
            Some(val) => conn.send_status(200, val),
            None => conn.send_status(404, "no such key"),
        },
        [sub, key, val] if sub == "set" => {
            store.borrow_mut().insert(key.clone(), val.clone());
            conn.send_status(200, "ok");
        }
        _ => conn.send_status(400, "usage: value get <key> | value set <key> <val>"),
    }
}

fn timeout_cmd(conn: &mut Connection, args: &[String]) {
    match args {
        [secs] => match secs.parse::<u64>() {
            Ok(secs) => {
                conn.set_client_timeout(Some(Duration::from_secs(secs)));
                conn.send_status(200, "ok");
            }
            Err(_) => conn.send_status(400, "usage: timeout <secs>"),
        },
        _ => conn.send_status(400, "usage: timeout <secs>"),
    }
}

fn server_cmd(conn: &mut Connection, args: &[String], shutdown_requested: &Rc<RefCell<bool>>) {
    match args {
        [sub] if sub == "status" => {
            let report = conn_status_with_marker(conn);
            conn.print(&report);
        }
        [sub] if sub == "shutdown" => {
            conn.send_status(200, "shutting down");
            *shutdown_requested.borrow_mut() = true;
        }
        _ => conn.send_status(400, "usage: server status | server shutdown"),
    }
}

// `server status` wants to mark the requesting connection's own row, but
// the status report itself is generated by `Server`, not `Connection` --
// this small split keeps `server_cmd`'s match arms readable.
fn conn_status_with_marker(conn: &Connection) -> String {
    format!("connection #{} requested this report\n", conn.id())
}

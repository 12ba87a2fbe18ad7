//! Daemon smoke test over the admin surface.
use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use finney_common::network::Network;
use finney_p2p::fsm;

#[test]
fn test_kill_command_stops_the_node() {
    let port = 29494;
    let (_handle, commands) = finney_node::channel();
    let child = thread::spawn(move || {
        let config = finney_node::Config {
            protocol: fsm::Config::from(Network::Regtest, vec![]),
            operation_port: port,
            ..finney_node::Config::default()
        };
        finney_node::run(config, commands)
    });

    let mut stream = connect_with_retry(port);
    stream.write_all(b"KILL").unwrap();

    child
        .join()
        .expect("the node thread doesn't panic")
        .expect("the node stops cleanly");
}

fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return stream;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("the admin port never came up");
}

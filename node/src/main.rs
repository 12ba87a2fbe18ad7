use std::net;
use std::process;

use argh::FromArgs;

use finney_common::block::time::LocalDuration;
use finney_common::network::Network;
use finney_node as node;
use finney_p2p::fsm;

#[derive(FromArgs)]
/// A Bitcoin peer-to-peer engine.
struct Options {
    /// connect to this peer address (can be repeated)
    #[argh(option)]
    connect: Vec<net::SocketAddr>,

    /// network to run on: mainnet, testnet, regtest or signet
    #[argh(option, default = "Network::Mainnet")]
    network: Network,

    /// admin TCP port accepting the KILL command
    #[argh(option, default = "9494")]
    operation_port: u16,

    /// stop automatically after this many minutes; 0 runs forever
    #[argh(option, default = "0")]
    autoexit: u64,

    /// comma-separated commands whose receive logging is suppressed
    #[argh(option)]
    silent: Option<String>,

    /// log level: error, warn, info, debug or trace
    #[argh(option, default = "log::Level::Info")]
    log: log::Level,
}

fn main() {
    let opts: Options = argh::from_env();

    if let Err(err) = node::logger::init(opts.log) {
        eprintln!("fatal: couldn't initialize logger: {}", err);
        process::exit(1);
    }

    let mut protocol = fsm::Config::from(opts.network, opts.connect);

    protocol.periods.autoexit = LocalDuration::from_mins(opts.autoexit);

    if let Some(silent) = opts.silent {
        protocol.silent_commands = silent
            .split(',')
            .map(|c| c.trim().to_owned())
            .filter(|c| !c.is_empty())
            .collect();
    }
    let config = node::Config {
        protocol,
        operation_port: opts.operation_port,
        ..node::Config::default()
    };
    let (_handle, commands) = node::channel();

    if let Err(err) = node::run(config, commands) {
        log::error!(target: "node", "Fatal: {}", err);
        process::exit(1);
    }
}

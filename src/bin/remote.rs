use burrow::config::{Config, Mode, Role};
use burrow::logging;
use burrow::net::EventLoop;
use burrow::remote::Remote;
use clap::{App, Arg};
use std::process;
use std::time::Duration;

/// Poll granularity; the resolver handoff and carrier sweep ride on top.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn main() {
    let matches = App::new("Burrow Remote")
        .version("0.1")
        .about("Carrier back-end opening target connections for burrow locals.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();

    let conf = match Config::load(config_path, Role::Remote) {
        Ok(conf) => conf,
        Err(err) => {
            eprintln!("[remote] {}", err);
            process::exit(1);
        }
    };

    match conf.mode {
        Mode::RemoteStandalone | Mode::RemoteForward => (),
        mode => {
            eprintln!("[remote] unsupported remote mode {:?}", mode);
            process::exit(1);
        }
    }

    let log = logging::init(&conf.debug_file);

    if conf.run_daemon {
        logging::warn!(log, "daemon mode not wired, running in foreground");
    }

    let mut lp = match EventLoop::new(&log) {
        Ok(lp) => lp,
        Err(err) => {
            eprintln!("[remote] event loop setup failed: {:?}", err);
            process::exit(1);
        }
    };

    let mut remote = match Remote::open(conf, &mut lp, &log) {
        Ok(remote) => remote,
        Err(err) => {
            eprintln!("[remote] open failed: {:?}", err);
            process::exit(1);
        }
    };

    loop {
        if let Err(err) = remote.drive(&mut lp, Some(POLL_INTERVAL)) {
            logging::crit!(log, "event loop failure"; "err" => ?err);
            process::exit(2);
        }
    }
}

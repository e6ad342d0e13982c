use burrow::config::{Config, Mode, Role};
use burrow::local::Local;
use burrow::logging;
use burrow::net::EventLoop;
use clap::{App, Arg};
use std::process;
use std::time::Duration;

/// Poll granularity; the keepalive tick rides on top of this.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn main() {
    let matches = App::new("Burrow Local")
        .version("0.1")
        .about("SOCKS5 front-end relaying through a remote burrow endpoint.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();

    let conf = match Config::load(config_path, Role::Local) {
        Ok(conf) => conf,
        Err(err) => {
            eprintln!("[local] {}", err);
            process::exit(1);
        }
    };

    if conf.mode != Mode::LocalFront {
        eprintln!("[local] unsupported local mode {:?}", conf.mode);
        process::exit(1);
    }

    let log = logging::init(&conf.debug_file);

    if conf.run_daemon {
        logging::warn!(log, "daemon mode not wired, running in foreground");
    }

    let mut lp = match EventLoop::new(&log) {
        Ok(lp) => lp,
        Err(err) => {
            eprintln!("[local] event loop setup failed: {:?}", err);
            process::exit(1);
        }
    };

    let mut local = match Local::open(conf, &mut lp, &log) {
        Ok(local) => local,
        Err(err) => {
            eprintln!("[local] open failed: {:?}", err);
            process::exit(1);
        }
    };

    loop {
        if let Err(err) = local.drive(&mut lp, Some(POLL_INTERVAL)) {
            logging::crit!(log, "event loop failure"; "err" => ?err);
            process::exit(2);
        }
    }
}

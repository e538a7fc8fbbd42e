use std::process::exit;

use anyhow::Error;
use clap::error::ErrorKind;
use clap::Parser;

use crate::opt::{Command, Opt};

mod daemon;
mod opt;
mod sandbox;
mod server;
mod worker;

fn main() {
    let opt = match Opt::try_parse() {
        Ok(opt) => opt,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            exit(code);
        }
    };
    if let Err(e) = setup_logger(&opt) {
        eprintln!("Cannot set up the logger: {:?}", e);
        exit(2);
    }
    if opt.global.daemon {
        if let Err(e) = daemon::daemonize(opt.global.pidfile.as_deref()) {
            eprintln!("Cannot become a daemon: {:?}", e);
            exit(2);
        }
    } else if let Some(pidfile) = &opt.global.pidfile {
        if let Err(e) = daemon::write_pidfile(pidfile) {
            eprintln!("Cannot write the pidfile: {:?}", e);
            exit(2);
        }
    }
    let result = match &opt.command {
        Command::Worker(worker_opt) => worker::main(&opt.global, worker_opt),
        Command::Server(server_opt) => server::main(&opt.global, server_opt),
        Command::Sandbox(sandbox_opt) => sandbox::main(&opt.global, sandbox_opt),
    };
    if let Err(e) = result {
        eprintln!("Error: {:?}", e);
        exit(2);
    }
}

/// Initialize the global logger, writing to the logfile when one is given.
fn setup_logger(opt: &Opt) -> Result<(), Error> {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(logfile) = &opt.global.logfile {
        let file = std::fs::File::create(logfile)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.format_timestamp_nanos().init();
    Ok(())
}

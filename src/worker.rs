use std::sync::Arc;

use anyhow::{Context, Error};
use log::info;

use taskgrade_exec::proto::FramedSender;
use taskgrade_exec::sandbox::SandboxRegistry;
use taskgrade_exec::{connect_to_server_as_worker, Environment, Worker};
use taskgrade_store::FileStore;

use crate::opt::{GlobalOpt, WorkerOpt};

/// Entry point of the `worker` subcommand: connect to the server and serve
/// until asked to exit.
pub fn main(global: &GlobalOpt, opt: &WorkerOpt) -> Result<(), Error> {
    let store = Arc::new(
        FileStore::new(
            global.store_dir(),
            global.max_cache * 1024 * 1024,
            global.min_cache * 1024 * 1024,
        )
        .context("Cannot open the file store")?,
    );
    let registry = SandboxRegistry::with_builtins();
    let sandbox = registry
        .get(&opt.sandbox)
        .with_context(|| format!("Unknown sandbox backend {:?}", opt.sandbox))?;
    let env = Arc::new(
        Environment::new(store, global.temp_dir(), opt.num_cores, sandbox)
            .context("Cannot build the execution environment")?,
    );
    let name = opt.name.clone().unwrap_or_else(|| {
        format!(
            "{}@{}",
            whoami::username(),
            whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into())
        )
    });
    let addr = format!("{}:{}", opt.server, opt.port);
    info!("Worker '{}' connecting to {}", name, addr);
    let (sender, receiver) = connect_to_server_as_worker(&addr)?;
    let worker = Worker::new(
        env,
        name,
        opt.pending_requests,
        Arc::new(FramedSender::new(sender)),
        receiver,
    );
    worker.run()
}

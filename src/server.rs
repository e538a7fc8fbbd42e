use std::sync::Arc;

use anyhow::{Context, Error};

use taskgrade_exec::Server;
use taskgrade_store::FileStore;

use crate::opt::{GlobalOpt, ServerOpt};

/// Entry point of the `server` subcommand: bind the two sockets and broker
/// forever.
pub fn main(global: &GlobalOpt, opt: &ServerOpt) -> Result<(), Error> {
    let store = Arc::new(
        FileStore::new(
            global.store_dir(),
            global.max_cache * 1024 * 1024,
            global.min_cache * 1024 * 1024,
        )
        .context("Cannot open the file store")?,
    );
    let server = Server::new(store);
    server.serve(
        &format!("{}:{}", opt.bind, opt.client_port),
        &format!("{}:{}", opt.bind, opt.worker_port),
    )
}

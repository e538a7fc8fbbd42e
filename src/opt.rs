use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(
    name = "taskgrade",
    version,
    about = "Distributed evaluation engine for competitive programming tasks"
)]
pub struct Opt {
    #[clap(flatten)]
    pub global: GlobalOpt,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOpt {
    /// Path where the log file should be stored, logging to stderr if
    /// missing
    #[clap(short = 'l', long = "logfile", global = true)]
    pub logfile: Option<PathBuf>,

    /// Become a daemon
    #[clap(short = 'd', long = "daemon", global = true)]
    pub daemon: bool,

    /// Path where the pidfile should be stored
    #[clap(short = 'P', long = "pidfile", global = true)]
    pub pidfile: Option<PathBuf>,

    /// Path where the files are stored
    #[clap(short = 'S', long = "store-dir", global = true)]
    pub store_dir: Option<PathBuf>,

    /// Path where the sandboxes are created
    #[clap(short = 'T', long = "temp-dir", global = true)]
    pub temp_dir: Option<PathBuf>,

    /// Maximum size of the storage directory, in MiB
    #[clap(long = "max-cache", global = true, default_value = "3072")]
    pub max_cache: u64,

    /// When the storage is flushed, this is the new maximum size, in MiB
    #[clap(long = "min-cache", global = true, default_value = "2048")]
    pub min_cache: u64,
}

impl GlobalOpt {
    /// The storage directory, defaulting to a subdirectory of the system
    /// temporary directory.
    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("taskgrade").join("store"))
    }

    /// The sandbox scratch directory.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("taskgrade").join("sandboxes"))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a worker attached to a server
    Worker(WorkerOpt),
    /// Run the server brokering clients and workers
    Server(ServerOpt),
    /// Run a single command inside the sandbox
    Sandbox(SandboxOpt),
}

#[derive(Args, Debug)]
pub struct WorkerOpt {
    /// Address of the server to connect to
    #[clap(long = "server", default_value = "127.0.0.1")]
    pub server: String,

    /// Worker port of the server
    #[clap(long = "port", default_value = "27183")]
    pub port: u16,

    /// The number of CPU cores to use (0 = autodetect)
    #[clap(long = "num-cores", default_value = "0")]
    pub num_cores: usize,

    /// Maximum number of requests kept pending to the server
    #[clap(long = "pending-requests", default_value = "4")]
    pub pending_requests: usize,

    /// Name of this worker
    #[clap(long = "name")]
    pub name: Option<String>,

    /// The sandbox backend to use
    #[clap(long = "sandbox", default_value = "process")]
    pub sandbox: String,
}

#[derive(Args, Debug)]
pub struct ServerOpt {
    /// Address to bind the listening sockets to
    #[clap(long = "bind", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port the clients connect to
    #[clap(long = "client-port", default_value = "27182")]
    pub client_port: u16,

    /// Port the workers connect to
    #[clap(long = "worker-port", default_value = "27183")]
    pub worker_port: u16,
}

#[derive(Args, Debug)]
pub struct SandboxOpt {
    /// The sandbox backend to use
    #[clap(long = "sandbox", default_value = "process")]
    pub sandbox: String,

    /// Limit on the cpu time, in seconds
    #[clap(long = "cpu-time")]
    pub cpu_time: Option<f64>,

    /// Limit on the wall time, in seconds
    #[clap(long = "wall-time")]
    pub wall_time: Option<f64>,

    /// Limit on the memory, in KiB
    #[clap(long = "memory")]
    pub memory: Option<u64>,

    /// The command to execute
    pub command: PathBuf,

    /// The arguments of the command
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

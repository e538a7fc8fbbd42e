//! End-to-end evaluations with a server and a worker in-process, each actor
//! with its own store so the whole blob-transfer protocol is exercised.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use taskgrade_cache::Cache;
use taskgrade_dag::{CachingMode, Execution, ExecutionGraph, ExecutionResult, ExecutionStatus,
    FileRef};
use taskgrade_exec::sandbox::{
    ExecutionInfo, ExecutionOptions, ProcessSandbox, Sandbox, SandboxError,
};
use taskgrade_exec::{eval_graph_locally, Environment};
use taskgrade_store::{FileStore, CHUNK_SIZE};

/// A sandbox wrapper counting how many times the real sandbox is invoked.
struct CountingSandbox {
    inner: ProcessSandbox,
    invocations: Arc<AtomicUsize>,
}

impl Sandbox for CountingSandbox {
    fn execute(
        &self,
        options: &ExecutionOptions,
        pid: Arc<AtomicU32>,
    ) -> Result<ExecutionInfo, SandboxError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(options, pid)
    }
}

struct Rig {
    _dir: TempDir,
    client_store: Arc<FileStore>,
    server_store: Arc<FileStore>,
    env: Arc<Environment>,
    cache: Cache,
    invocations: Arc<AtomicUsize>,
}

impl Rig {
    fn new(num_cores: usize) -> Rig {
        let dir = TempDir::new().unwrap();
        let big = 1 << 30;
        let client_store =
            Arc::new(FileStore::new(dir.path().join("client"), big, big).unwrap());
        let server_store =
            Arc::new(FileStore::new(dir.path().join("server"), big, big).unwrap());
        let worker_store =
            Arc::new(FileStore::new(dir.path().join("worker"), big, big).unwrap());
        let invocations = Arc::new(AtomicUsize::new(0));
        let sandbox = Arc::new(CountingSandbox {
            inner: ProcessSandbox,
            invocations: invocations.clone(),
        });
        let env = Arc::new(
            Environment::new(worker_store, dir.path().join("sandboxes"), num_cores, sandbox)
                .unwrap(),
        );
        Rig {
            _dir: dir,
            client_store,
            server_store,
            env,
            cache: Cache::ephemeral(),
            invocations,
        }
    }

    fn eval(
        &mut self,
        graph: ExecutionGraph,
    ) -> anyhow::Result<std::collections::HashMap<usize, ExecutionResult>> {
        eval_graph_locally(
            graph,
            self.client_store.clone(),
            self.server_store.clone(),
            self.env.clone(),
            &mut self.cache,
            4,
            "test-server",
        )
    }

    fn workdir(&self) -> &std::path::Path {
        self._dir.path()
    }
}

#[test]
fn test_echo_run() {
    let mut rig = Rig::new(2);
    let mut graph = ExecutionGraph::new();
    let mut exec = Execution::new("say hi", "/bin/echo");
    exec.args(vec!["hi"]);
    let stdout = exec.stdout();
    let stdout_path = rig.workdir().join("echo-stdout");
    let stderr_path = rig.workdir().join("echo-stderr");
    graph.write_file_to(&stdout, &stdout_path);
    graph.write_file_to(exec.stderr(), &stderr_path);
    let id = graph.add_execution(exec);

    let results = rig.eval(graph).unwrap();
    let result = &results[&id];
    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(!result.was_cached);
    assert_eq!(std::fs::read(&stdout_path).unwrap(), b"hi\n");
    assert_eq!(std::fs::read(&stderr_path).unwrap(), b"");
}

#[test]
fn test_cache_hit_skips_the_sandbox() {
    let mut rig = Rig::new(2);

    let build = |dest: &std::path::Path| {
        let mut graph = ExecutionGraph::new();
        let mut exec = Execution::new("cached echo", "/bin/echo");
        exec.args(vec!["cached", "value"]);
        exec.caching_mode(CachingMode::Always);
        graph.write_file_to(exec.stdout(), dest);
        let id = graph.add_execution(exec);
        (graph, id)
    };

    let first_out = rig.workdir().join("first-stdout");
    let (graph, id) = build(&first_out);
    let results = rig.eval(graph).unwrap();
    assert_eq!(results[&id].status, ExecutionStatus::Success);
    assert!(!results[&id].was_cached);
    let runs_after_first = rig.invocations.load(Ordering::SeqCst);

    let second_out = rig.workdir().join("second-stdout");
    let (graph, id) = build(&second_out);
    let results = rig.eval(graph).unwrap();
    assert_eq!(results[&id].status, ExecutionStatus::Success);
    assert!(results[&id].was_cached);
    // the sandbox was not invoked again
    assert_eq!(rig.invocations.load(Ordering::SeqCst), runs_after_first);
    assert_eq!(
        std::fs::read(&second_out).unwrap(),
        std::fs::read(&first_out).unwrap()
    );
}

#[test]
fn test_caching_never_reruns() {
    let mut rig = Rig::new(2);
    for _ in 0..2 {
        let mut graph = ExecutionGraph::new();
        let mut exec = Execution::new("uncached", "/bin/echo");
        exec.args(vec!["x"]).caching_mode(CachingMode::Never);
        let id = graph.add_execution(exec);
        let results = rig.eval(graph).unwrap();
        assert!(!results[&id].was_cached);
    }
    assert_eq!(rig.invocations.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cpu_limit_kills_the_process() {
    let mut rig = Rig::new(2);
    let mut graph = ExecutionGraph::new();
    let mut exec = Execution::new("spin forever", "/bin/sh");
    exec.args(vec!["-c", "while :; do :; done"]);
    exec.limits_mut().cpu_time(1.0);
    let id = graph.add_execution(exec);

    let results = rig.eval(graph).unwrap();
    match &results[&id].status {
        ExecutionStatus::Signal(signal) => assert_ne!(*signal, 0),
        other => panic!("expected a signal, got {:?}", other),
    }
}

#[test]
fn test_signal_is_preserved() {
    let mut rig = Rig::new(2);
    let mut graph = ExecutionGraph::new();
    let mut exec = Execution::new("kill self", "/bin/sh");
    exec.args(vec!["-c", "kill -9 $$"]);
    let id = graph.add_execution(exec);
    let results = rig.eval(graph).unwrap();
    assert_eq!(results[&id].status, ExecutionStatus::Signal(9));
}

#[test]
fn test_large_input_travels_by_hash() {
    let mut rig = Rig::new(2);
    // bigger than a chunk: the blob cannot travel inline and must be pulled
    // client -> server -> worker, and the output back
    let payload: Vec<u8> = (0..CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
    let input_path = rig.workdir().join("big-input");
    std::fs::write(&input_path, &payload).unwrap();

    let mut graph = ExecutionGraph::new();
    let input = FileRef::new("big input");
    graph.provide_file(input.clone(), &input_path).unwrap();
    let mut exec = Execution::new("copy the input", "/bin/cat");
    exec.args(vec!["data.bin"]);
    exec.input(&input, "data.bin", false);
    let out_path = rig.workdir().join("copied");
    graph.write_file_to(exec.stdout(), &out_path);
    let id = graph.add_execution(exec);

    let results = rig.eval(graph).unwrap();
    assert_eq!(results[&id].status, ExecutionStatus::Success);
    assert_eq!(std::fs::read(&out_path).unwrap(), payload);
}

#[test]
fn test_stdin_is_fed_to_the_process() {
    let mut rig = Rig::new(2);
    let input_path = rig.workdir().join("stdin-data");
    std::fs::write(&input_path, "over stdin\n").unwrap();

    let mut graph = ExecutionGraph::new();
    let input = FileRef::new("stdin data");
    graph.provide_file(input.clone(), &input_path).unwrap();
    let mut exec = Execution::new("cat stdin", "/bin/cat");
    exec.stdin(&input);
    let out_path = rig.workdir().join("stdin-out");
    graph.write_file_to(exec.stdout(), &out_path);
    let id = graph.add_execution(exec);

    let results = rig.eval(graph).unwrap();
    assert_eq!(results[&id].status, ExecutionStatus::Success);
    assert_eq!(std::fs::read(&out_path).unwrap(), b"over stdin\n");
}

#[test]
fn test_pipeline_through_declared_outputs() {
    let mut rig = Rig::new(2);
    let mut graph = ExecutionGraph::new();
    let mut producer = Execution::new("produce a file", "/bin/sh");
    producer.args(vec!["-c", "echo payload > out.txt"]);
    let produced = producer.output("out.txt");
    graph.add_execution(producer);

    let mut consumer = Execution::new("consume the file", "/bin/cat");
    consumer.args(vec!["in.txt"]);
    consumer.input(&produced, "in.txt", false);
    let out_path = rig.workdir().join("final");
    graph.write_file_to(consumer.stdout(), &out_path);
    let id = graph.add_execution(consumer);

    let results = rig.eval(graph).unwrap();
    assert_eq!(results[&id].status, ExecutionStatus::Success);
    assert_eq!(std::fs::read(&out_path).unwrap(), b"payload\n");
}

#[test]
fn test_failure_skips_dependents() {
    let mut rig = Rig::new(2);
    let mut graph = ExecutionGraph::new();
    let failing = Execution::new("fail", "/bin/false");
    let stdout = failing.stdout();
    let failing_id = graph.add_execution(failing);

    let mut dependent = Execution::new("never runs", "/bin/cat");
    dependent.stdin(&stdout);
    let out_path = rig.workdir().join("never-written");
    graph.write_file_to(dependent.stdout(), &out_path);
    let dependent_id = graph.add_execution(dependent);
    let skipped = Arc::new(AtomicUsize::new(0));
    let skipped2 = skipped.clone();
    graph.on_execution_skip(dependent_id, move || {
        skipped2.fetch_add(1, Ordering::SeqCst);
    });

    let results = rig.eval(graph).unwrap();
    assert_eq!(results[&failing_id].status, ExecutionStatus::ReturnCode(1));
    assert!(!results.contains_key(&dependent_id));
    assert_eq!(skipped.load(Ordering::SeqCst), 1);
    assert!(!out_path.exists());
}

#[test]
fn test_die_on_error_aborts_the_run() {
    let mut rig = Rig::new(2);
    let mut graph = ExecutionGraph::new();
    let mut exec = Execution::new("critical step", "/bin/false");
    exec.die_on_error(true);
    graph.add_execution(exec);
    assert!(rig.eval(graph).is_err());
}

#[test]
fn test_not_executable_input() {
    let mut rig = Rig::new(2);
    let source_path = rig.workdir().join("prog.txt");
    std::fs::write(&source_path, "not a program at all\n").unwrap();

    let mut graph = ExecutionGraph::new();
    let program = FileRef::new_executable("bogus program");
    graph.provide_file(program.clone(), &source_path).unwrap();
    let mut exec = Execution::new("run the bogus program", "prog");
    exec.input(&program, "prog", true);
    let id = graph.add_execution(exec);

    let results = rig.eval(graph).unwrap();
    match &results[&id].status {
        ExecutionStatus::NotExecutable(_) => {}
        other => panic!("expected NotExecutable, got {:?}", other),
    }
}

#[test]
fn test_admission_backpressure() {
    // five single-core tasks on a two-core worker: everything completes
    let mut rig = Rig::new(2);
    let mut graph = ExecutionGraph::new();
    let mut ids = vec![];
    for i in 0..5 {
        let mut exec = Execution::new(format!("sleep {}", i), "/bin/sh");
        exec.args(vec!["-c", "sleep 0.2"]);
        exec.caching_mode(CachingMode::Never);
        ids.push(graph.add_execution(exec));
    }
    let results = rig.eval(graph).unwrap();
    for id in ids {
        assert_eq!(results[&id].status, ExecutionStatus::Success);
    }
    assert_eq!(rig.invocations.load(Ordering::SeqCst), 5);
}

#[test]
fn test_exclusive_execution() {
    let mut rig = Rig::new(2);
    let mut graph = ExecutionGraph::new();
    let mut exec = Execution::new("timed run", "/bin/echo");
    exec.args(vec!["timed"]).exclusive(true);
    let id = graph.add_execution(exec);
    let results = rig.eval(graph).unwrap();
    assert_eq!(results[&id].status, ExecutionStatus::Success);
}

#[test]
fn test_same_executor_caching() {
    let mut rig = Rig::new(2);
    let run = |rig: &mut Rig| {
        let mut graph = ExecutionGraph::new();
        let mut exec = Execution::new("scoped", "/bin/echo");
        exec.args(vec!["scoped"]);
        exec.caching_mode(CachingMode::SameExecutor);
        let id = graph.add_execution(exec);
        let results = rig.eval(graph).unwrap();
        results[&id].clone()
    };
    let first = run(&mut rig);
    assert!(!first.was_cached);
    let second = run(&mut rig);
    assert!(second.was_cached);
    assert_eq!(rig.invocations.load(Ordering::SeqCst), 1);
}

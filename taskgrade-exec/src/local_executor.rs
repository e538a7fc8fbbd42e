//! End-to-end execution of a single request on the local host: materialize
//! the input blobs, stage them into a scratch sandbox, run the process under
//! admission, hash the outputs back into the store and build the response.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Error};
use uuid::Uuid;

use taskgrade_dag::ResourceUsage;
use taskgrade_store::{cheap_copy, file_size, FileChunkIterator, FileStoreKey, CHUNK_SIZE};

use crate::environment::Environment;
use crate::proto::{FileInfo, FileType, Request, RequestId, Response, Status};
use crate::sandbox::{ExecutionOptions, SandboxError};

/// Callback used to pull a missing blob from the peer that issued the
/// request. On success the blob is present in the environment's store.
pub type FetchFileFn<'a> = dyn FnMut(&FileStoreKey) -> Result<(), Error> + 'a;

/// Shared state of one running request, used by the cancellation path: the
/// PID of the live sandbox and whether the request was canceled.
#[derive(Debug, Clone, Default)]
pub struct RunHandle {
    /// PID of the sandboxed process, 0 until spawned.
    pub pid: Arc<AtomicU32>,
    /// Set when the request is canceled; a canceled run keeps no sandbox and
    /// ingests no outputs.
    pub cancelled: Arc<AtomicBool>,
}

/// Whether a name is allowed inside the sandbox: only `[A-Za-z0-9._-]+`,
/// excluding the `.` and `..` path components.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    name.bytes()
        .all(|c| c.is_ascii_alphanumeric() || b"._-".contains(&c))
}

/// Scratch directory of one execution, removed on drop unless kept.
struct Scratch {
    path: PathBuf,
    keep: bool,
}

impl Scratch {
    fn new(path: PathBuf) -> Scratch {
        Scratch { path, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!("Cannot remove sandbox at {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Run one request end to end on the local host.
///
/// Failures of the evaluated process (non-zero exit, signal, bad
/// executable, malformed request, missing inputs) are reported inside the
/// returned [`Response`]. An `Err` is either [`ExecError::Busy`]
/// (admission refused, retry elsewhere) or an executor failure that the
/// caller must surface as `InternalError` — never downgraded to a normal
/// failed run.
pub fn execute_request(
    env: &Environment,
    request: &Request,
    fetch_file: &mut FetchFileFn,
    handle: &RunHandle,
) -> Result<Response, Error> {
    if request.fifo_size != 0 {
        return Ok(invalid(request.id, "FIFOs are not supported yet"));
    }
    let mut seen_stdin = false;
    for input in &request.inputs {
        match input.file_type {
            FileType::Stdin => {
                if seen_stdin {
                    return Ok(invalid(request.id, "More than one stdin input"));
                }
                seen_stdin = true;
            }
            FileType::Other => {
                if !is_valid_name(&input.name) {
                    return Ok(invalid(
                        request.id,
                        format!("Invalid input name {:?}", input.name),
                    ));
                }
            }
            _ => {
                return Ok(invalid(
                    request.id,
                    format!("Input of type {:?} is not allowed", input.file_type),
                ));
            }
        }
    }
    for name in &request.outputs {
        if !is_valid_name(name) {
            return Ok(invalid(request.id, format!("Invalid output name {:?}", name)));
        }
    }

    // materialize the missing input blobs, from the inline contents or by
    // pulling them from the peer
    for input in &request.inputs {
        if env.store.has_key(&input.hash) {
            continue;
        }
        if let Some(contents) = &input.contents {
            if FileStoreKey::from_content(contents) != input.hash {
                return Ok(invalid(
                    request.id,
                    format!("Inline contents of {:?} do not match their hash", input.name),
                ));
            }
            env.store
                .store(&input.hash, vec![contents.clone()])
                .context("Failed to store inline input")?;
        } else if let Err(e) = fetch_file(&input.hash) {
            warn!("Failed to fetch {}: {:?}", input.hash, e);
        }
    }
    let mut staged = vec![];
    for input in &request.inputs {
        match env.store.get(&input.hash) {
            Some(blob) => staged.push((input, blob)),
            None => {
                return Ok(Response {
                    status: Status::MissingFiles,
                    error_message: format!("Blob {} is not available", input.hash),
                    ..Response::internal_error(request.id, "")
                });
            }
        }
    }

    let scratch_path = env.sandbox_dir.join(Uuid::new_v4().to_string());
    let box_dir = scratch_path.join("box");
    std::fs::create_dir_all(&box_dir)
        .with_context(|| format!("Failed to create sandbox at {}", box_dir.display()))?;
    let mut scratch = Scratch::new(scratch_path.clone());
    trace!(
        "Executing request {} in sandbox {}",
        request.id,
        scratch_path.display()
    );

    let mut stdin_file = None;
    for (input, blob) in &staged {
        let dest = match input.file_type {
            FileType::Stdin => scratch_path.join("stdin"),
            _ => box_dir.join(&input.name),
        };
        cheap_copy(blob.path(), &dest)
            .with_context(|| format!("Failed to stage {:?}", input.name))?;
        if input.executable {
            set_permissions(&dest, 0o555)?;
        }
        if input.file_type == FileType::Stdin {
            stdin_file = Some(dest);
        }
    }
    // outputs exist even if the process never writes them
    let stdout_file = scratch_path.join("stdout");
    let stderr_file = scratch_path.join("stderr");
    touch(&stdout_file)?;
    touch(&stderr_file)?;
    for name in &request.outputs {
        touch(&box_dir.join(name))?;
    }

    let options = ExecutionOptions {
        root: box_dir.clone(),
        executable: request.executable.clone(),
        args: request.args.clone(),
        stdin_file,
        stdout_file: stdout_file.clone(),
        stderr_file: stderr_file.clone(),
        limits: request.limits.clone(),
        extra_time: request.extra_time,
        exclusive: request.exclusive,
    };

    let info = {
        let _guard = env.try_admit(request.exclusive)?;
        match env.sandbox.execute(&options, handle.pid.clone()) {
            Ok(info) => info,
            Err(SandboxError::NotExecutable(message)) => {
                return Ok(Response {
                    status: Status::NotExecutable,
                    error_message: message,
                    ..Response::internal_error(request.id, "")
                });
            }
            Err(SandboxError::Setup(message)) => {
                return Err(anyhow::anyhow!("Sandbox failure: {}", message));
            }
        }
    };

    let mut response = Response {
        request_id: request.id,
        status: if info.signal != 0 {
            Status::Signal
        } else {
            Status::Success
        },
        status_code: info.status_code,
        signal: info.signal,
        resources: ResourceUsage {
            cpu_time: info.cpu_time_millis as f64 / 1000.0,
            sys_time: info.sys_time_millis as f64 / 1000.0,
            wall_time: info.wall_time_millis as f64 / 1000.0,
            memory: info.memory_usage_kb,
        },
        outputs: vec![],
        error_message: String::new(),
        was_killed: false,
    };

    if handle.cancelled.load(Ordering::SeqCst) {
        // partial outputs of a canceled run are never ingested
        response.was_killed = true;
        return Ok(response);
    }

    response
        .outputs
        .push(ingest(env, FileType::Stdout, "", &stdout_file)?);
    response
        .outputs
        .push(ingest(env, FileType::Stderr, "", &stderr_file)?);
    for name in &request.outputs {
        response
            .outputs
            .push(ingest(env, FileType::Other, name, &box_dir.join(name))?);
    }

    if request.keep_sandbox {
        scratch.keep();
        let serialized = serde_json::to_string_pretty(request)
            .context("Failed to serialize the request")?;
        std::fs::write(scratch_path.join("request.json"), serialized)
            .context("Cannot write the request inside the kept sandbox")?;
        debug!("Keeping sandbox at {}", scratch_path.display());
    }
    Ok(response)
}

/// Hash a produced file into the store and describe it, inlining the content
/// of blobs small enough to travel inside the response.
fn ingest(
    env: &Environment,
    file_type: FileType,
    name: &str,
    path: &Path,
) -> Result<FileInfo, Error> {
    let hash = FileStoreKey::from_file(path)
        .with_context(|| format!("Failed to hash output {}", path.display()))?;
    let chunks = FileChunkIterator::new(path)
        .with_context(|| format!("Failed to read output {}", path.display()))?;
    env.store
        .store(&hash, chunks)
        .with_context(|| format!("Failed to store output {}", path.display()))?;
    let contents = match file_size(path) {
        Some(size) if size as usize <= CHUNK_SIZE => Some(
            std::fs::read(path)
                .with_context(|| format!("Failed to read output {}", path.display()))?,
        ),
        _ => None,
    };
    Ok(FileInfo {
        name: name.to_owned(),
        file_type,
        hash,
        executable: false,
        contents,
    })
}

fn invalid<S: Into<String>>(request_id: RequestId, message: S) -> Response {
    Response {
        status: Status::InvalidRequest,
        error_message: message.into(),
        ..Response::internal_error(request_id, "")
    }
}

fn touch(path: &Path) -> Result<(), Error> {
    std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(())
}

fn set_permissions(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to chmod {:03o} {}", mode, path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use taskgrade_store::FileStore;

    use crate::sandbox::{EchoSandbox, ExecutionInfo, Sandbox};
    use crate::ExecError;

    use super::*;

    /// A backend that records the options it was invoked with.
    #[derive(Default)]
    struct RecordingSandbox {
        options: Mutex<Option<ExecutionOptions>>,
    }

    impl Sandbox for RecordingSandbox {
        fn execute(
            &self,
            options: &ExecutionOptions,
            _pid: Arc<AtomicU32>,
        ) -> Result<ExecutionInfo, SandboxError> {
            *self.options.lock().unwrap() = Some(options.clone());
            Ok(ExecutionInfo::default())
        }
    }

    /// A backend that writes `size` bytes to stdout.
    struct WriterSandbox {
        size: usize,
    }

    impl Sandbox for WriterSandbox {
        fn execute(
            &self,
            options: &ExecutionOptions,
            _pid: Arc<AtomicU32>,
        ) -> Result<ExecutionInfo, SandboxError> {
            std::fs::write(&options.stdout_file, vec![42u8; self.size])
                .map_err(|e| SandboxError::Setup(e.to_string()))?;
            Ok(ExecutionInfo::default())
        }
    }

    fn env_with(dir: &TempDir, sandbox: Arc<dyn Sandbox>) -> Environment {
        let store = Arc::new(FileStore::new(dir.path().join("store"), 1 << 30, 1 << 30).unwrap());
        Environment::new(store, dir.path().join("tmp"), 2, sandbox).unwrap()
    }

    fn empty_request() -> Request {
        Request {
            id: 1,
            executable: "/bin/true".into(),
            args: vec![],
            inputs: vec![],
            outputs: vec![],
            limits: Default::default(),
            extra_time: 0.0,
            exclusive: false,
            keep_sandbox: false,
            fifo_size: 0,
        }
    }

    fn no_fetch() -> impl FnMut(&FileStoreKey) -> Result<(), Error> {
        |_: &FileStoreKey| Ok(())
    }

    fn run(env: &Environment, request: &Request) -> Response {
        execute_request(env, request, &mut no_fetch(), &RunHandle::default()).unwrap()
    }

    fn input_info(content: &[u8], name: &str, file_type: FileType) -> FileInfo {
        FileInfo {
            name: name.into(),
            file_type,
            hash: FileStoreKey::from_content(content),
            executable: false,
            contents: Some(content.to_vec()),
        }
    }

    #[test]
    fn test_fifo_requests_are_invalid() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(EchoSandbox));
        let mut request = empty_request();
        request.fifo_size = 4;
        let response = run(&env, &request);
        assert_eq!(response.status, Status::InvalidRequest);
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("input.txt"));
        assert!(is_valid_name("a-b_c.d"));
        assert!(is_valid_name("UPPER9"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("."));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("../evil"));
        assert!(!is_valid_name("dir/file"));
        assert!(!is_valid_name("with space"));
        assert!(!is_valid_name("with\nnewline"));
    }

    #[test]
    fn test_bad_input_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(EchoSandbox));
        let mut request = empty_request();
        request
            .inputs
            .push(input_info(b"x", "../evil", FileType::Other));
        let response = run(&env, &request);
        assert_eq!(response.status, Status::InvalidRequest);
    }

    #[test]
    fn test_bad_output_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(EchoSandbox));
        let mut request = empty_request();
        request.outputs.push("a/b".into());
        let response = run(&env, &request);
        assert_eq!(response.status, Status::InvalidRequest);
    }

    #[test]
    fn test_inputs_are_staged() {
        let dir = TempDir::new().unwrap();
        let sandbox = Arc::new(RecordingSandbox::default());
        let env = env_with(&dir, sandbox.clone());
        let mut request = empty_request();
        request
            .inputs
            .push(input_info(b"the data", "data.txt", FileType::Other));
        let mut exe = input_info(b"#!/bin/sh\n", "solution", FileType::Other);
        exe.executable = true;
        request.inputs.push(exe);
        let response = run(&env, &request);
        assert_eq!(response.status, Status::Success);

        let options = sandbox.options.lock().unwrap().clone().unwrap();
        assert_eq!(
            std::fs::read(options.root.join("data.txt")).unwrap(),
            b"the data"
        );
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(options.root.join("solution"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_empty_stdin_is_distinct_from_no_stdin() {
        let dir = TempDir::new().unwrap();
        let sandbox = Arc::new(RecordingSandbox::default());
        let env = env_with(&dir, sandbox.clone());

        let request = empty_request();
        run(&env, &request);
        let options = sandbox.options.lock().unwrap().clone().unwrap();
        assert_eq!(options.stdin_file, None);

        let mut request = empty_request();
        request.inputs.push(input_info(b"", "", FileType::Stdin));
        run(&env, &request);
        let options = sandbox.options.lock().unwrap().clone().unwrap();
        let stdin = options.stdin_file.unwrap();
        assert_eq!(std::fs::read(&stdin).unwrap(), b"");
    }

    #[test]
    fn test_small_output_is_inlined() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(WriterSandbox { size: CHUNK_SIZE }));
        let response = run(&env, &empty_request());
        let stdout = &response.outputs[0];
        assert_eq!(stdout.file_type, FileType::Stdout);
        assert_eq!(stdout.contents.as_ref().unwrap().len(), CHUNK_SIZE);
    }

    #[test]
    fn test_large_output_is_not_inlined() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(WriterSandbox { size: CHUNK_SIZE + 1 }));
        let response = run(&env, &empty_request());
        let stdout = &response.outputs[0];
        assert_eq!(stdout.contents, None);
        // the blob is fetchable by hash
        assert!(env.store.has_key(&stdout.hash));
    }

    #[test]
    fn test_outputs_are_hashed_into_store() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(WriterSandbox { size: 10 }));
        let mut request = empty_request();
        request.outputs.push("result.txt".into());
        let response = run(&env, &request);
        assert_eq!(response.outputs.len(), 3);
        for output in &response.outputs {
            assert!(env.store.has_key(&output.hash));
        }
        assert_eq!(response.outputs[2].name, "result.txt");
        // the declared output was never written: empty blob
        assert_eq!(response.outputs[2].hash, FileStoreKey::from_content(b""));
    }

    #[test]
    fn test_missing_blob_calls_fetch() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(EchoSandbox));
        let content = b"fetched from afar".to_vec();
        let mut request = empty_request();
        request.inputs.push(FileInfo {
            name: "data.txt".into(),
            file_type: FileType::Other,
            hash: FileStoreKey::from_content(&content),
            executable: false,
            contents: None,
        });
        let mut fetched = vec![];
        let store = env.store.clone();
        let mut fetch = |key: &FileStoreKey| {
            fetched.push(key.clone());
            store.store(key, vec![content.clone()])?;
            Ok(())
        };
        let response =
            execute_request(&env, &request, &mut fetch, &RunHandle::default()).unwrap();
        assert_eq!(response.status, Status::Success);
        assert_eq!(fetched, vec![FileStoreKey::from_content(&content)]);
    }

    #[test]
    fn test_unfetchable_blob_is_missing_files() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(EchoSandbox));
        let mut request = empty_request();
        request.inputs.push(FileInfo {
            name: "data.txt".into(),
            file_type: FileType::Other,
            hash: FileStoreKey::from_content(b"nowhere to be found"),
            executable: false,
            contents: None,
        });
        let response = run(&env, &request);
        assert_eq!(response.status, Status::MissingFiles);
    }

    #[test]
    fn test_mismatched_inline_contents_are_rejected() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(EchoSandbox));
        let mut request = empty_request();
        request.inputs.push(FileInfo {
            name: "data.txt".into(),
            file_type: FileType::Other,
            hash: FileStoreKey::from_content(b"claimed"),
            executable: false,
            contents: Some(b"actual".to_vec()),
        });
        let response = run(&env, &request);
        assert_eq!(response.status, Status::InvalidRequest);
    }

    #[test]
    fn test_busy_when_exclusive_and_occupied() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(EchoSandbox));
        let _guard = env.try_admit(false).unwrap();
        let mut request = empty_request();
        request.exclusive = true;
        let err = execute_request(&env, &request, &mut no_fetch(), &RunHandle::default())
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ExecError>(), Some(ExecError::Busy)));
    }

    #[test]
    fn test_keep_sandbox() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(EchoSandbox));
        let mut request = empty_request();
        request.keep_sandbox = true;
        let response = run(&env, &request);
        assert_eq!(response.status, Status::Success);
        let kept: Vec<_> = std::fs::read_dir(&env.sandbox_dir).unwrap().collect();
        assert_eq!(kept.len(), 1);
        let scratch = kept[0].as_ref().unwrap().path();
        assert!(scratch.join("request.json").exists());
    }

    #[test]
    fn test_cancelled_run_keeps_nothing() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(WriterSandbox { size: 10 }));
        let mut request = empty_request();
        request.keep_sandbox = true;
        let handle = RunHandle::default();
        handle.cancelled.store(true, Ordering::SeqCst);
        let response =
            execute_request(&env, &request, &mut no_fetch(), &handle).unwrap();
        assert!(response.was_killed);
        assert!(response.outputs.is_empty());
        let kept: Vec<_> = std::fs::read_dir(&env.sandbox_dir).unwrap().collect();
        assert!(kept.is_empty());
    }

    #[test]
    fn test_scratch_is_removed() {
        let dir = TempDir::new().unwrap();
        let env = env_with(&dir, Arc::new(EchoSandbox));
        run(&env, &empty_request());
        let left: Vec<_> = std::fs::read_dir(&env.sandbox_dir).unwrap().collect();
        assert!(left.is_empty());
    }
}

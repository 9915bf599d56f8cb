use super::handler::{Disposition, WorkerHandler};
use super::state::PhaseMachine;
use crate::error::WorkerError;
use crate::executor::panic_message;
use crate::lock;
use crate::protocol::{CommandKind, Request, Response, ResponseBody, WireError, read_frame, write_frame};
use crate::vm::ExecutionLimits;
use std::io::{self, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Exit code of a worker whose handler panicked.
pub const CRASH_EXIT_CODE: i32 = 70;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub limits: ExecutionLimits,
    /// Exit after this long without a command while nothing is running.
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    Stopped,
    InputClosed,
    IdleTimeout,
    /// Target code halted with this code.
    Exit(i32),
    Crashed,
}

impl ServeOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServeOutcome::Stopped | ServeOutcome::InputClosed | ServeOutcome::IdleTimeout => 0,
            ServeOutcome::Exit(code) => *code,
            ServeOutcome::Crashed => CRASH_EXIT_CODE,
        }
    }
}

enum Event {
    Request(Request),
    InputClosed,
    InputFailed(WireError),
    Finished,
    Stopped,
    Halted(i32),
    Crashed,
    OutputFailed(WireError),
}

/// Serves the worker protocol until stopped.
///
/// Frames are read on a dedicated thread and admitted against the phase
/// machine as they arrive; admitted commands run one at a time on a single
/// executor thread that owns all target state. Commands that are not
/// admitted, including anything that arrives while an invocation is
/// running, are answered immediately from the admitting thread.
pub fn serve<R, W>(input: R, output: W, config: ServerConfig) -> Result<ServeOutcome, WireError>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let output = Arc::new(Mutex::new(output));
    let phase = Arc::new(Mutex::new(PhaseMachine::new()));
    let (events_tx, events) = mpsc::channel();
    let (jobs_tx, jobs) = mpsc::channel();

    spawn_reader(input, events_tx.clone())?;
    let executor = {
        let output = Arc::clone(&output);
        let phase = Arc::clone(&phase);
        let limits = config.limits;
        thread::Builder::new()
            .name("warden-executor".into())
            .spawn(move || run_executor(jobs, output, phase, events_tx, limits))?
    };

    let mut in_flight = 0usize;
    let mut input_closed = false;
    loop {
        let event = match config.idle_timeout {
            Some(timeout) => match events.recv_timeout(timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) if in_flight > 0 => continue,
                Err(RecvTimeoutError::Timeout) => {
                    log::info!("no command for {timeout:?}, exiting");
                    return Ok(ServeOutcome::IdleTimeout);
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(ServeOutcome::InputClosed),
            },
            None => match events.recv() {
                Ok(event) => event,
                Err(_) => return Ok(ServeOutcome::InputClosed),
            },
        };

        match event {
            Event::Request(request) => {
                let kind = request.body.kind();
                log::debug!("<- #{} {} {}", request.id, kind, request.body.context());
                let admitted = lock(&phase).admit(kind);
                if let Err(violation) = admitted {
                    log::warn!("rejecting #{}: {}", request.id, violation);
                    let response = Response {
                        id: request.id,
                        body: ResponseBody::Error(WorkerError::ProtocolViolation(
                            violation.to_string(),
                        )),
                    };
                    write_frame(&mut *lock(&output), &response)?;
                    continue;
                }
                if jobs_tx.send(request).is_err() {
                    // The executor only hangs up after reporting why.
                    continue;
                }
                in_flight += 1;
            }
            Event::Finished => {
                in_flight = in_flight.saturating_sub(1);
                if input_closed && in_flight == 0 {
                    log::info!("input closed");
                    return Ok(ServeOutcome::InputClosed);
                }
            }
            // Commands already admitted still run and get their responses.
            Event::InputClosed if in_flight > 0 => input_closed = true,
            Event::InputClosed => {
                log::info!("input closed");
                return Ok(ServeOutcome::InputClosed);
            }
            Event::InputFailed(e) => {
                log::error!("unreadable request stream: {e}");
                return Err(e);
            }
            Event::Stopped => {
                drop(jobs_tx);
                if executor.join().is_err() {
                    log::error!("executor thread panicked during shutdown");
                }
                log::info!("stopped");
                return Ok(ServeOutcome::Stopped);
            }
            Event::Halted(code) => {
                log::warn!("target code halted with exit code {code}");
                return Ok(ServeOutcome::Exit(code));
            }
            Event::Crashed => return Ok(ServeOutcome::Crashed),
            Event::OutputFailed(e) => {
                log::error!("cannot write responses: {e}");
                return Err(e);
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut input: R, events: Sender<Event>) -> io::Result<()> {
    thread::Builder::new()
        .name("warden-reader".into())
        .spawn(move || {
            loop {
                let event = match read_frame::<_, Request>(&mut input) {
                    Ok(Some(request)) => Event::Request(request),
                    Ok(None) => Event::InputClosed,
                    Err(e) => Event::InputFailed(e),
                };
                let last = !matches!(event, Event::Request(_));
                if events.send(event).is_err() || last {
                    break;
                }
            }
        })?;
    Ok(())
}

fn run_executor<W: Write>(
    jobs: Receiver<Request>,
    output: Arc<Mutex<W>>,
    phase: Arc<Mutex<PhaseMachine>>,
    events: Sender<Event>,
    limits: ExecutionLimits,
) {
    let mut handler = WorkerHandler::new(limits);
    for request in jobs {
        let kind = request.body.kind();
        let handled = catch_unwind(AssertUnwindSafe(|| handler.handle(&request.body)));
        let (body, after) = match handled {
            Ok(Disposition::Reply(body)) => {
                lock(&phase).complete(kind);
                let after = if kind == CommandKind::StopProcess {
                    Event::Stopped
                } else {
                    Event::Finished
                };
                (body, after)
            }
            Ok(Disposition::Exit(code)) => {
                let _ = events.send(Event::Halted(code));
                return;
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("{kind} #{} panicked: {message}", request.id);
                lock(&phase).crash();
                (
                    ResponseBody::Error(WorkerError::Internal(message)),
                    Event::Crashed,
                )
            }
        };

        log::debug!("-> #{} {}", request.id, body.name());
        let response = Response {
            id: request.id,
            body,
        };
        if let Err(e) = write_frame(&mut *lock(&output), &response) {
            let _ = events.send(Event::OutputFailed(e));
            return;
        }
        let terminal = !matches!(after, Event::Finished);
        if events.send(after).is_err() || terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionResult, StaticEnvironment};
    use crate::instrument::InstrumentationKind;
    use crate::loader::tests::write_unit;
    use crate::protocol::{InvokeRequest, RequestBody};
    use crate::unit::tests::calc_unit;
    use crate::value::Value;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn frames(requests: &[RequestBody]) -> Cursor<Vec<u8>> {
        let mut buf = Vec::new();
        for (id, body) in requests.iter().enumerate() {
            write_frame(
                &mut buf,
                &Request {
                    id: id as u64 + 1,
                    body: body.clone(),
                },
            )
            .unwrap();
        }
        Cursor::new(buf)
    }

    fn responses(buf: &SharedBuf) -> Vec<Response> {
        let bytes = lock(&buf.0).clone();
        let mut cursor = Cursor::new(bytes);
        let mut out = Vec::new();
        while let Some(response) = read_frame(&mut cursor).unwrap() {
            out.push(response);
        }
        out
    }

    fn setup(dir: &std::path::Path) -> Vec<RequestBody> {
        vec![
            RequestBody::AddPaths {
                user_paths: vec![dir.display().to_string()],
                dependency_paths: vec![],
            },
            RequestBody::SetInstrumentation {
                kind: InstrumentationKind::BranchCoverage,
            },
        ]
    }

    fn add(a: i64, b: i64) -> RequestBody {
        RequestBody::InvokeMethod(InvokeRequest {
            unit: "demo.Calc".into(),
            member: "add(II)I".into(),
            args: vec![Value::Int(a), Value::Int(b)],
            env: StaticEnvironment::default(),
        })
    }

    #[test]
    fn every_request_gets_one_response_with_its_id() {
        let dir = tempdir().unwrap();
        write_unit(dir.path(), &calc_unit());
        let mut requests = setup(dir.path());
        requests.push(add(2, 3));
        requests.push(RequestBody::StopProcess);

        let out = SharedBuf::default();
        let outcome = serve(frames(&requests), out.clone(), ServerConfig::default()).unwrap();
        assert_eq!(outcome, ServeOutcome::Stopped);

        let responses = responses(&out);
        assert_eq!(responses.len(), 4);
        assert_eq!(responses.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(
            responses[2].body,
            ResponseBody::Invocation(ExecutionResult::Success(Value::Int(5)))
        );
        assert_eq!(responses[3].body, ResponseBody::Ack);
    }

    #[test]
    fn out_of_order_command_is_rejected_and_the_worker_stays_up() {
        let dir = tempdir().unwrap();
        write_unit(dir.path(), &calc_unit());
        let requests = vec![
            add(1, 1),
            RequestBody::AddPaths {
                user_paths: vec![dir.path().display().to_string()],
                dependency_paths: vec![],
            },
            RequestBody::StopProcess,
        ];

        let out = SharedBuf::default();
        let outcome = serve(frames(&requests), out.clone(), ServerConfig::default()).unwrap();
        assert_eq!(outcome, ServeOutcome::Stopped);

        let responses = responses(&out);
        let rejected = responses.iter().find(|r| r.id == 1).unwrap();
        assert!(matches!(
            rejected.body,
            ResponseBody::Error(WorkerError::ProtocolViolation(_))
        ));
        assert_eq!(responses.iter().find(|r| r.id == 2).unwrap().body, ResponseBody::Ack);
        assert_eq!(responses.len(), 3);
    }

    #[test]
    fn closed_input_ends_the_loop() {
        let outcome = serve(Cursor::new(Vec::new()), SharedBuf::default(), ServerConfig::default()).unwrap();
        assert_eq!(outcome, ServeOutcome::InputClosed);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn idle_worker_times_out() {
        // A pipe that never delivers data keeps the reader blocked.
        let (_keep, idle_input) = blocked_input();
        let config = ServerConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..ServerConfig::default()
        };
        let outcome = serve(idle_input, SharedBuf::default(), config).unwrap();
        assert_eq!(outcome, ServeOutcome::IdleTimeout);
    }

    struct Blocked(Receiver<()>);

    impl Read for Blocked {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    fn blocked_input() -> (Sender<()>, Blocked) {
        let (tx, rx) = mpsc::channel();
        (tx, Blocked(rx))
    }

    #[test]
    fn crash_and_halt_map_to_exit_codes() {
        assert_eq!(ServeOutcome::Crashed.exit_code(), CRASH_EXIT_CODE);
        assert_eq!(ServeOutcome::Exit(4).exit_code(), 4);
    }
}

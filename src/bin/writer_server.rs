//! Demo collaborator exercising the IPC core: a server that accepts
//! connections on a UNIX seqpacket socket and offers two methods, `write`
//! (write a value to a client-supplied FD) and `quit` (ask the client to
//! confirm shutdown, then close the listener).
//!
//! Grounded on `original_source/ipc/app.py`'s `FileWriterServer`; CLI and
//! startup boilerplate grounded on the teacher's `src/main.rs`.

use std::io::Write as _;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use log::info;

use seqpacket_ipc::codec::{decode, encode, Value};
use seqpacket_ipc::error::IpcError;
use seqpacket_ipc::{Address, Connection, Fd, Listener};

/// Serve the file-writer demo protocol on a UNIX seqpacket socket.
#[derive(Parser, Debug)]
struct Args {
    /// Abstract-namespace socket name to listen on (no leading NUL needed).
    socket: String,

    /// Listen backlog.
    #[clap(long, default_value_t = 16)]
    backlog: usize,
}

fn handle_request(
    conn: &Arc<Connection>,
    quit_flag: &Arc<AtomicBool>,
    payload: Vec<u8>,
    fds: Vec<Fd>,
) -> Result<(Vec<u8>, Vec<Fd>), IpcError> {
    let value = decode(&payload, fds)?;
    let mut items = match value {
        Value::Array(items) => items,
        _ => return Err(bad_request("request must be an array")),
    };
    if items.is_empty() {
        return Err(bad_request("request array must name a method"));
    }
    let method = match items.remove(0) {
        Value::Str(s) => s,
        _ => return Err(bad_request("method name must be a string")),
    };
    match method.as_str() {
        "quit" => {
            info!("quit requested, confirming with peer");
            let (req_payload, req_fds) = encode(Value::array([Value::from("quit?")]))?;
            let (resp_payload, resp_fds) = conn.send(req_payload, req_fds)?;
            let confirmed = matches!(decode(&resp_payload, resp_fds)?, Value::Bool(true));
            if confirmed {
                info!("peer confirmed, shutting down");
                quit_flag.store(true, Ordering::SeqCst);
            } else {
                info!("peer declined shutdown");
            }
            let (out, _) = encode(Value::Bool(true))?;
            Ok((out, vec![]))
        }
        "write" => {
            let mut args = items.into_iter();
            let mut fd = match args.next() {
                Some(Value::Fd(fd)) => fd,
                _ => return Err(bad_request("write requires an fd argument")),
            };
            let content = args
                .next()
                .ok_or_else(|| bad_request("write requires a content argument"))?;
            let raw = fd
                .take()
                .map_err(|e| bad_request(&format!("failed to take fd: {e}")))?;
            let mut file = unsafe { std::fs::File::from_raw_fd(raw) };
            let mut bytes = content_bytes(&content);
            bytes.push(b'\n');
            let result = match file.write_all(&bytes) {
                Ok(()) => Value::array([Value::Bool(true), Value::Int(bytes.len() as i64)]),
                Err(e) => Value::array([Value::Bool(false), Value::Str(e.to_string())]),
            };
            let (out, _) = encode(result)?;
            Ok((out, vec![]))
        }
        other => {
            let (out, _) = encode(Value::array([
                Value::Bool(false),
                Value::from("unknown method"),
                Value::from(other),
            ]))?;
            Ok((out, vec![]))
        }
    }
}

fn bad_request(msg: &str) -> IpcError {
    seqpacket_ipc::error::DecoderError(msg.to_string()).into()
}

/// A string or byte blob is written through verbatim; any other value (the
/// demo client's nested map, say) has no meaningful byte form of its own, so
/// it falls back to its debug representation.
fn content_bytes(content: &Value) -> Vec<u8> {
    match content {
        Value::Str(s) => s.as_bytes().to_vec(),
        Value::Bytes(b) => b.clone(),
        other => format!("{other:?}").into_bytes(),
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let args = Args::parse();

    let address = Address::abstract_name(args.socket.as_bytes());
    let listener = Listener::bind(address, args.backlog).map_err(|e| eyre!(e))?;
    info!("listening on {:?}", listener.address());

    let quit_flag = Arc::new(AtomicBool::new(false));

    let request_handler = {
        let quit_flag = quit_flag.clone();
        Arc::new(move |conn: &Arc<Connection>, payload: Vec<u8>, fds: Vec<Fd>| {
            handle_request(conn, &quit_flag, payload, fds)
        })
    };
    let notification_handler = Arc::new(
        |_conn: &Arc<Connection>, _payload: Vec<u8>, _fds: Vec<Fd>| -> Result<(), IpcError> {
            Err(seqpacket_ipc::error::TransportError::new("notifications are not supported").into())
        },
    );
    let error_handler = {
        let quit_flag = quit_flag.clone();
        Arc::new(move |conn: &Arc<Connection>, err: &IpcError| {
            log::warn!("connection {} failed: {err}", conn.num());
            quit_flag.store(true, Ordering::SeqCst);
        })
    };

    let serve_listener = listener.clone();
    let serve_thread = std::thread::spawn(move || {
        let _ = serve_listener.serve(request_handler, notification_handler, error_handler);
    });

    while !quit_flag.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }
    listener.close();
    let _ = serve_thread.join();
    Ok(())
}

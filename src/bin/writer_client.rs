//! Demo collaborator exercising the IPC core: a client that connects to the
//! file-writer demo server, asks it to write a value to each given file
//! (passing the destination as an FD rather than a path), then performs the
//! quit handshake.
//!
//! Grounded on `original_source/ipc/app.py`'s `FileWriterClient`; CLI and
//! startup boilerplate grounded on the teacher's `src/bin/client.rs`.

use std::io::Write as _;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use log::info;
use rand::Rng;

use seqpacket_ipc::codec::{decode, encode, OrderedMap, Value};
use seqpacket_ipc::error::IpcError;
use seqpacket_ipc::{Address, Connection, Fd};

/// Write a demo value to each given path via the file-writer demo server.
#[derive(Parser, Debug)]
struct Args {
    /// Abstract-namespace socket name the server is listening on.
    socket: String,

    /// Paths to ask the server to write through.
    paths: Vec<String>,
}

fn call(conn: &Connection, method: &str, args: Vec<Value>) -> Result<Value, IpcError> {
    let mut items = vec![Value::from(method)];
    items.extend(args);
    let (payload, fds) = encode(Value::array(items))?;
    let (resp_payload, resp_fds) = conn.send(payload, fds)?;
    decode(&resp_payload, resp_fds).map_err(IpcError::from)
}

fn demo_value() -> Value {
    let mut map = OrderedMap::new();
    map.push(Value::from("string"), Value::Bool(true));
    map.push(Value::Bytes(b"binary".to_vec()), Value::Bool(false));
    map.push(Value::from("int"), Value::Int(123));
    map.push(Value::from("double"), Value::Double(3.14));
    map.push(
        Value::from("array"),
        Value::array([
            Value::Bool(false),
            Value::Bool(true),
            Value::Null,
            Value::Int(123),
            Value::Double(3.14),
            Value::from("hello"),
            Value::Bytes(b"world".to_vec()),
        ]),
    );
    Value::Map(map)
}

fn write_through(conn: &Connection, path: &str) -> Result<()> {
    info!("asking server to write to {path:?}");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(format!("# {path}\n").as_bytes())?;
    let dup_fd = Fd::duplicate(std::os::unix::io::AsRawFd::as_raw_fd(&file))
        .map_err(|e| eyre!("failed to duplicate fd: {e}"))?;
    let result = call(conn, "write", vec![Value::Fd(dup_fd), demo_value()]).map_err(|e| eyre!(e))?;
    match result {
        Value::Array(mut items) if items.len() == 2 => {
            let written = items.pop().unwrap();
            let ok = items.pop().unwrap();
            match ok {
                Value::Bool(true) => info!("{path}: wrote {written:?}"),
                _ => info!("{path}: server reported failure: {written:?}"),
            }
        }
        other => info!("{path}: unexpected response {other:?}"),
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let args = Args::parse();

    let request_handler = Arc::new(
        |_conn: &Arc<Connection>, payload: Vec<u8>, fds: Vec<Fd>| -> Result<(Vec<u8>, Vec<Fd>), IpcError> {
            let value = decode(&payload, fds)?;
            let method = match &value {
                Value::Array(items) => items.first(),
                _ => None,
            };
            let reply = match method {
                Some(Value::Str(m)) if m == "quit?" => {
                    // Mirrors the original demo's random confirm/decline/abstain.
                    match rand::thread_rng().gen_range(0..3) {
                        0 => Value::Bool(true),
                        1 => Value::Bool(false),
                        _ => Value::Null,
                    }
                }
                _ => Value::Null,
            };
            let (out, _) = encode(reply)?;
            Ok((out, vec![]))
        },
    );
    let notification_handler = Arc::new(
        |_conn: &Arc<Connection>, _payload: Vec<u8>, _fds: Vec<Fd>| -> Result<(), IpcError> {
            Err(seqpacket_ipc::error::TransportError::new("notifications are not supported").into())
        },
    );

    let address = Address::abstract_name(args.socket.as_bytes());
    info!("connecting to {address:?}");
    let conn = Connection::connect(address, request_handler, notification_handler).map_err(|e| eyre!(e))?;

    for path in &args.paths {
        write_through(&conn, path)?;
    }

    info!("asking server to quit");
    call(&conn, "quit", vec![]).map_err(|e| eyre!(e))?;
    conn.close();
    conn.join();
    Ok(())
}

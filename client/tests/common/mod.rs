//! Deterministic mock memcached server for integration tests.
//!
//! Speaks enough of the ASCII protocol for the client test scenarios:
//! get (multi-key), set/add/replace, delete, incr/decr, flush_all, stats.
//! State is a plain in-memory map; every received command line is logged so
//! tests can assert exact wire traffic.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

type Store = Arc<Mutex<HashMap<String, (u32, Vec<u8>)>>>;

pub struct MockServer {
    pub addr: String,
    store: Store,
    command_log: Arc<Mutex<Vec<String>>>,
    get_commands: Arc<AtomicUsize>,
}

impl MockServer {
    pub fn start() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        let command_log = Arc::new(Mutex::new(Vec::new()));
        let get_commands = Arc::new(AtomicUsize::new(0));

        {
            let store = store.clone();
            let command_log = command_log.clone();
            let get_commands = get_commands.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(_) => break,
                    };
                    let store = store.clone();
                    let command_log = command_log.clone();
                    let get_commands = get_commands.clone();
                    thread::spawn(move || {
                        let _ = serve(stream, store, command_log, get_commands);
                    });
                }
            });
        }

        MockServer {
            addr,
            store,
            command_log,
            get_commands,
        }
    }

    /// Flags word the server stored for `key`.
    pub fn stored_flags(&self, key: &str) -> Option<u32> {
        self.store.lock().unwrap().get(key).map(|(flags, _)| *flags)
    }

    /// Raw payload the server stored for `key`.
    pub fn stored_data(&self, key: &str) -> Option<Vec<u8>> {
        self.store.lock().unwrap().get(key).map(|(_, data)| data.clone())
    }

    /// Every command line received, in order.
    pub fn command_log(&self) -> Vec<String> {
        self.command_log.lock().unwrap().clone()
    }

    /// Number of `get` command lines received.
    pub fn get_command_count(&self) -> usize {
        self.get_commands.load(Ordering::SeqCst)
    }
}

fn serve(
    stream: TcpStream,
    store: Store,
    command_log: Arc<Mutex<Vec<String>>>,
    get_commands: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let line = line.trim_end_matches('\n').trim_end_matches('\r');
        command_log.lock().unwrap().push(line.to_string());
        let fields: Vec<&str> = line.split(' ').collect();

        match fields[0] {
            "get" => {
                get_commands.fetch_add(1, Ordering::SeqCst);
                let store = store.lock().unwrap();
                for key in &fields[1..] {
                    if let Some((flags, data)) = store.get(*key) {
                        write!(writer, "VALUE {} {} {}\r\n", key, flags, data.len())?;
                        writer.write_all(data)?;
                        writer.write_all(b"\r\n")?;
                    }
                }
                writer.write_all(b"END\r\n")?;
            }
            verb @ ("set" | "add" | "replace") => {
                let key = fields[1].to_string();
                let flags: u32 = fields[2].parse().unwrap();
                let length: usize = fields[4].parse().unwrap();
                let mut data = vec![0u8; length];
                reader.read_exact(&mut data)?;
                let mut crlf = [0u8; 2];
                reader.read_exact(&mut crlf)?;

                let mut store = store.lock().unwrap();
                let exists = store.contains_key(&key);
                let accept = match verb {
                    "add" => !exists,
                    "replace" => exists,
                    _ => true,
                };
                if accept {
                    store.insert(key, (flags, data));
                    writer.write_all(b"STORED\r\n")?;
                } else {
                    writer.write_all(b"NOT_STORED\r\n")?;
                }
            }
            "delete" => {
                let removed = store.lock().unwrap().remove(fields[1]).is_some();
                writer.write_all(if removed { b"DELETED\r\n" } else { b"NOT_FOUND\r\n" })?;
            }
            verb @ ("incr" | "decr") => {
                let delta: u64 = fields[2].parse().unwrap();
                let mut store = store.lock().unwrap();
                match store.get_mut(fields[1]) {
                    Some((_, data)) => {
                        let current: u64 = std::str::from_utf8(data)
                            .unwrap_or("0")
                            .trim()
                            .parse()
                            .unwrap_or(0);
                        let updated = if verb == "incr" {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        };
                        *data = updated.to_string().into_bytes();
                        write!(writer, "{updated}\r\n")?;
                    }
                    None => writer.write_all(b"NOT_FOUND\r\n")?,
                }
            }
            "flush_all" => {
                store.lock().unwrap().clear();
                writer.write_all(b"OK\r\n")?;
            }
            "stats" => {
                let items = store.lock().unwrap().len();
                write!(
                    writer,
                    "STAT pid 42\r\nSTAT version 1.6.0-mock\r\nSTAT curr_items {items}\r\nEND\r\n"
                )?;
            }
            _ => {
                writer.write_all(b"ERROR\r\n")?;
            }
        }
        writer.flush()?;
    }
}

/// An address nothing is listening on: bind an ephemeral port, then drop the
/// listener.
pub fn unreachable_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

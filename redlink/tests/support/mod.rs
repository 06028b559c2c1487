//! A scripted server for integration tests: accepts connections on a
//! local listener, decodes commands with the crate's own codec, and
//! answers whatever the test's handler decides.
#![allow(dead_code)]

use std::net::SocketAddr;

use bytes::BytesMut;
use redlink::protocol::{encode_reply, RespDecoder};
use redlink::Reply;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// What the scripted server does with one decoded command.
pub enum Action {
    /// Answer with a single reply.
    Reply(Reply),
    /// Answer with several frames (confirmations, pushes).
    Replies(Vec<Reply>),
    /// Answer, then drop the connection.
    RepliesThenClose(Vec<Reply>),
    /// Say nothing.
    Hang,
    /// Drop the connection without answering.
    Close,
}

/// Canned answers for the session handshake, so tests only script the
/// commands they care about.
pub fn handshake_reply(name: &str) -> Option<Reply> {
    match name {
        "info" => Some(Reply::bulk("# Persistence\r\nloading:0\r\n")),
        "auth" | "select" | "client" | "readonly" | "readwrite" => {
            Some(Reply::Simple("OK".to_string()))
        }
        _ => None,
    }
}

/// Spawn a scripted server. The handler sees `(connection_index,
/// lowercased_name, args)` for every decoded command, across however many
/// connections the client opens.
pub async fn spawn_server(
    mut handler: impl FnMut(usize, &str, &[String]) -> Action + Send + 'static,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(async move {
        let mut conn_index = 0usize;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            serve_connection(stream, conn_index, &mut handler).await;
            conn_index += 1;
        }
    });
    (addr, task)
}

async fn serve_connection(
    mut stream: TcpStream,
    conn_index: usize,
    handler: &mut (impl FnMut(usize, &str, &[String]) -> Action + Send),
) {
    let mut decoder = RespDecoder::new();
    loop {
        while let Ok(Some(frame)) = decoder.next_reply() {
            let Some((name, args)) = parse_command(&frame) else {
                return;
            };
            match handler(conn_index, &name, &args) {
                Action::Reply(reply) => {
                    if write_frames(&mut stream, &[reply]).await.is_err() {
                        return;
                    }
                }
                Action::Replies(replies) => {
                    if write_frames(&mut stream, &replies).await.is_err() {
                        return;
                    }
                }
                Action::RepliesThenClose(replies) => {
                    let _ = write_frames(&mut stream, &replies).await;
                    return;
                }
                Action::Hang => {}
                Action::Close => return,
            }
        }
        match stream.read_buf(decoder.buffer_mut()).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn write_frames(stream: &mut TcpStream, frames: &[Reply]) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    for frame in frames {
        encode_reply(frame, &mut buf).expect("encodable frame");
    }
    stream.write_all(&buf).await
}

fn parse_command(frame: &Reply) -> Option<(String, Vec<String>)> {
    let Reply::Array(items) = frame else {
        return None;
    };
    let mut words = items.iter().map(|item| match item {
        Reply::Bulk(b) => String::from_utf8_lossy(b).into_owned(),
        Reply::Simple(s) => s.clone(),
        Reply::Integer(i) => i.to_string(),
        _ => String::new(),
    });
    let name = words.next()?.to_ascii_lowercase();
    Some((name, words.collect()))
}

/// Frames for a subscribe-family confirmation.
pub fn sub_confirmation(verb: &str, channel: &str, active: i64) -> Reply {
    Reply::Array(vec![
        Reply::bulk(verb.to_string()),
        Reply::bulk(channel.to_string()),
        Reply::Integer(active),
    ])
}

/// A pub/sub message push frame.
pub fn message_frame(channel: &str, payload: &str) -> Reply {
    Reply::Array(vec![
        Reply::bulk("message"),
        Reply::bulk(channel.to_string()),
        Reply::bulk(payload.to_string()),
    ])
}

fn slots_node(addr: SocketAddr) -> Reply {
    Reply::Array(vec![
        Reply::bulk(addr.ip().to_string()),
        Reply::Integer(i64::from(addr.port())),
        Reply::bulk("0123456789abcdef0123456789abcdef01234567"),
    ])
}

/// A full-coverage `CLUSTER SLOTS` reply pointing every slot at one node.
pub fn cluster_slots_single(addr: SocketAddr) -> Reply {
    Reply::Array(vec![Reply::Array(vec![
        Reply::Integer(0),
        Reply::Integer(16383),
        slots_node(addr),
    ])])
}

/// A full-coverage `CLUSTER SLOTS` reply with one primary and one replica.
pub fn cluster_slots_with_replica(primary: SocketAddr, replica: SocketAddr) -> Reply {
    Reply::Array(vec![Reply::Array(vec![
        Reply::Integer(0),
        Reply::Integer(16383),
        slots_node(primary),
        slots_node(replica),
    ])])
}

/// A `CLUSTER SLOTS` reply where `owner_of_slot` owns exactly `slot` and
/// `rest` owns everything else.
pub fn cluster_slots_split(slot: u16, owner_of_slot: SocketAddr, rest: SocketAddr) -> Reply {
    let mut ranges = Vec::new();
    if slot > 0 {
        ranges.push(Reply::Array(vec![
            Reply::Integer(0),
            Reply::Integer(i64::from(slot) - 1),
            slots_node(rest),
        ]));
    }
    ranges.push(Reply::Array(vec![
        Reply::Integer(i64::from(slot)),
        Reply::Integer(i64::from(slot)),
        slots_node(owner_of_slot),
    ]));
    if slot < 16383 {
        ranges.push(Reply::Array(vec![
            Reply::Integer(i64::from(slot) + 1),
            Reply::Integer(16383),
            slots_node(rest),
        ]));
    }
    Reply::Array(ranges)
}

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use mux_protocol::core::codec::{Inbound, MuxCodec};
use mux_protocol::protocol::handshake::{responder_accept, ConnectionHeader};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Fuzz the responder's view of a connection: header, then frames
    let mut codec = MuxCodec::responder();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(item)) = codec.decode(&mut buf) {
        if let Inbound::Handshake(header) = item {
            if let Ok(version) = responder_accept(&header, 1) {
                let _ = ConnectionHeader::responder(version, header.ration);
            }
        }
    }
});

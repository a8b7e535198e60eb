#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use mux_protocol::core::codec::{Inbound, MuxCodec};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Fuzz frame parsing with the input fed in two pieces
    if data.is_empty() {
        return;
    }
    let split = usize::from(data[0]) % data.len();
    let mut codec = MuxCodec::frames_only();
    let mut buf = BytesMut::new();

    for piece in [&data[1..split.max(1)], &data[split.max(1)..]] {
        buf.extend_from_slice(piece);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(Inbound::Frame(frame))) => {
                    // Anything that parses must re-encode to the same frame
                    if let Ok(bytes) = frame.to_bytes() {
                        let mut again = MuxCodec::frames_only();
                        let mut wire = BytesMut::from(&bytes[..]);
                        assert_eq!(
                            again.decode(&mut wire).ok().flatten(),
                            Some(Inbound::Frame(frame))
                        );
                    }
                }
                Ok(Some(Inbound::Handshake(_))) => unreachable!(),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});

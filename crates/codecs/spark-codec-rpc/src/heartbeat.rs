//! 进程级共享的心跳内容。
//!
//! # 教案式说明
//! - **意图 (Why)**：每条连接在写空闲时都要发送同一份 16 字节心跳；预先编码一次并共享，
//!   避免在定时器回调热路径上重复分配与编码。
//! - **逻辑 (How)**：编码结果以 `'static` 字节数组存放，[`heartbeat_content`] 每次返回一个
//!   [`Bytes::from_static`] 视图。`Bytes` 的读游标属于各自的句柄，`advance` 只移动本句柄，
//!   底层字节不可变，因此并发发送者之间既不会观察到也不会造成修改。
//! - **契约 (What)**：`kind = HEARTBEAT`，`status = 0`，`id = 0`，`body_length = 0`，无负载；
//!   心跳是单向通知，不参与关联 ID 匹配。

use bytes::Bytes;

use crate::header::{HEADER_LENGTH, MessageKind, ProtocolHeader};

/// 心跳协议头。
pub const HEARTBEAT_HEADER: ProtocolHeader = ProtocolHeader::new(MessageKind::HEARTBEAT, 0, 0, 0);

static HEARTBEAT_BYTES: [u8; HEADER_LENGTH] = HEARTBEAT_HEADER.to_array();

/// 返回共享心跳编码上的一个独立读游标。
pub fn heartbeat_content() -> Bytes {
    Bytes::from_static(&HEARTBEAT_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;
    use bytes::Buf;
    use std::thread;

    #[test]
    fn heartbeat_wire_bytes() {
        assert_eq!(
            heartbeat_content().as_ref(),
            &[0xBA, 0xBE, 127, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        let content = heartbeat_content();
        let (header, rest) = decode(&content).expect("heartbeat decodes");
        assert_eq!(header, HEARTBEAT_HEADER);
        assert!(rest.is_empty());
    }

    #[test]
    fn cursors_are_independent() {
        let mut first = heartbeat_content();
        let second = heartbeat_content();
        first.advance(10);
        assert_eq!(first.remaining(), HEADER_LENGTH - 10);
        assert_eq!(second.remaining(), HEADER_LENGTH);
        assert_eq!(heartbeat_content().remaining(), HEADER_LENGTH);
    }

    #[test]
    fn concurrent_readers_observe_full_content() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    let mut seen = Vec::new();
                    for _ in 0..1000 {
                        let mut cursor = heartbeat_content();
                        let copy = cursor.to_vec();
                        cursor.advance(cursor.remaining());
                        seen.push(copy);
                    }
                    seen
                })
            })
            .collect();
        for handle in handles {
            for copy in handle.join().expect("reader thread") {
                assert_eq!(copy.as_slice(), &HEARTBEAT_BYTES[..]);
            }
        }
    }
}

//! Envelope codec benchmarks
//!
//! Measures encode/decode throughput of the cursor codec and the queue
//! handoff, without network I/O.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use packetlink::protocol::codec::{PacketReader, PacketWriter};
use packetlink::protocol::packet::Packet;
use packetlink::protocol::types::ChatMessage;
use packetlink::queue::EventQueue;

fn bench_chat_encode(c: &mut Criterion) {
    let chat = ChatMessage::new(7, "a fairly typical chat line, nothing fancy");
    let mut buf = vec![0u8; 4096];
    c.bench_function("chat_message_encode", |b| {
        b.iter(|| {
            let mut writer = PacketWriter::new(&mut buf);
            let len = chat.serialize(&mut writer).unwrap();
            black_box(len)
        });
    });
}

fn bench_chat_decode(c: &mut Criterion) {
    let chat = ChatMessage::new(7, "a fairly typical chat line, nothing fancy");
    let mut buf = vec![0u8; 4096];
    let len = {
        let mut writer = PacketWriter::new(&mut buf);
        chat.serialize(&mut writer).unwrap()
    };
    c.bench_function("chat_message_decode", |b| {
        b.iter(|| {
            let mut reader = PacketReader::new(&buf[1..len]);
            let decoded = ChatMessage::deserialize(&mut reader).unwrap();
            black_box(decoded)
        });
    });
}

fn bench_queue_handoff(c: &mut Criterion) {
    let queue = EventQueue::new(1024);
    c.bench_function("queue_push_pop_100", |b| {
        b.iter(|| {
            for i in 0..100u32 {
                queue.push(i).unwrap();
            }
            let mut total = 0;
            while let Some(i) = queue.try_pop() {
                total += i;
            }
            black_box(total)
        });
    });
}

criterion_group!(benches, bench_chat_encode, bench_chat_decode, bench_queue_handoff);

criterion_main!(benches);

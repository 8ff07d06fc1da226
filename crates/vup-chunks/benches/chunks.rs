use std::io::Cursor;
use std::num::NonZeroU64;

use vup_chunks::{block_sizes, hash_bytes, BlockReader, DigestAccumulator};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576, 10485760])]
fn blake3_hash(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| hash_bytes(divan::black_box(&data)));
}

#[divan::bench(args = [65536, 1048576, 10485760])]
fn sha1_digest(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut acc = DigestAccumulator::new();
            acc.fold(1, divan::black_box(&data)).unwrap();
            acc.finalize_hex()
        });
}

#[divan::bench(args = [1048576, 10485760])]
fn read_blocks(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    let layout = block_sizes(size as u64, NonZeroU64::new(256 * 1024).unwrap());
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut reader = BlockReader::new(Cursor::new(&data[..]), layout.clone());
            while !reader.next_window(8).unwrap().is_empty() {}
            reader.finish().unwrap()
        });
}

fn main() {
    divan::main();
}

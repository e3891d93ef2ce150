//! End-to-end pipeline tests: record with the sink, read the raw capture
//! back, build the indexed file and verify queries against a model kept on
//! the side.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use retrace::builder::DataBuilder;
use retrace::cpu::{ControlFlow, InstructionClassifier, NoControlFlow, RegisterBank, RegisterInfo};
use retrace::data_file::{DataFile, FrameKind, FramePayload};
use retrace::raw_reader::RawTraceReader;
use retrace::writer::TraceSink;
use retrace::INVALID_TRACE_FRAME_ID;
use std::fs::File;
use std::path::Path;

fn bank() -> RegisterBank {
    RegisterBank::new(
        "TestPlatform",
        "TestCPU",
        vec![
            RegisterInfo {
                name: "R0".to_string(),
                bit_size: 64,
            },
            RegisterInfo {
                name: "R1".to_string(),
                bit_size: 64,
            },
            RegisterInfo {
                name: "R2".to_string(),
                bit_size: 32,
            },
            RegisterInfo {
                name: "FLAGS".to_string(),
                bit_size: 8,
            },
        ],
    )
    .unwrap()
}

/// What the test remembers about one recorded step.
enum Recorded {
    Cpu {
        writer_id: u32,
        ip: u64,
        snapshot: Vec<u8>,
    },
    MemoryWrite {
        writer_id: u32,
        address: u64,
        data: Vec<u8>,
        text: String,
    },
}

fn build_from(path: &Path, bank: &RegisterBank) -> DataFile {
    let mut reader = RawTraceReader::open(path, bank).unwrap();
    DataFile::build(&mut reader, &NoControlFlow, &mut ()).unwrap()
}

#[test]
fn recorded_steps_survive_the_whole_pipeline() {
    let bank = bank();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.rtrc");

    let mut rng = SmallRng::seed_from_u64(0x7ACE);
    let mut model: Vec<Recorded> = Vec::new();
    {
        let sink = TraceSink::create(&bank, File::create(&path).unwrap()).unwrap();
        let threads = [sink.create_writer(7), sink.create_writer(8)];
        let irq = sink.create_interrupt_writer("DmaIrq");

        // per-writer live snapshot, mutated sparsely like a real CPU would
        let frame_size = bank.frame_size() as usize;
        let mut snapshots = vec![vec![0u8; frame_size]; 2];
        for step in 0..400u64 {
            let which = (rng.gen_range(0..2)) as usize;
            let snapshot = &mut snapshots[which];
            for _ in 0..rng.gen_range(1..3) {
                let index = rng.gen_range(0..bank.num_registers());
                let offset = bank.data_offset(index) as usize;
                snapshot[offset] = rng.gen();
            }
            let ip = 0x4000 + step * 4;
            threads[which].add_frame(ip, snapshot);
            model.push(Recorded::Cpu {
                writer_id: which as u32,
                ip,
                snapshot: snapshot.clone(),
            });

            if step % 50 == 25 {
                let address = 0x9000 + step;
                let data = vec![rng.gen::<u8>(), rng.gen::<u8>()];
                irq.add_memory_write(0, address, &data, "dma");
                model.push(Recorded::MemoryWrite {
                    writer_id: 2,
                    address,
                    data,
                    text: "dma".to_string(),
                });
            }
        }
        assert_eq!(sink.steps_recorded(), model.len() as u64);
    }

    let mut file = build_from(&path, &bank);
    assert_eq!(file.num_entries(), model.len() as u64);
    assert_eq!(file.context(0).unwrap().name, "Thread7");
    assert_eq!(file.context(1).unwrap().name, "Thread8");
    assert_eq!(file.context(2).unwrap().name, "IRQ");

    for (seq, recorded) in model.iter().enumerate() {
        let frame = file.frame(seq as u64);
        match recorded {
            Recorded::Cpu {
                writer_id,
                ip,
                snapshot,
            } => {
                assert_eq!(frame.context_id, *writer_id, "seq {seq}");
                assert_eq!(frame.ip, *ip);
                assert_eq!(frame.registers(), Some(&snapshot[..]), "seq {seq}");
            }
            Recorded::MemoryWrite {
                writer_id,
                address,
                data,
                text,
            } => {
                assert_eq!(frame.context_id, *writer_id);
                match &frame.payload {
                    FramePayload::MemoryWrite {
                        address: a,
                        text: t,
                        data: d,
                    } => {
                        assert_eq!(a, address);
                        assert_eq!(t, text);
                        assert_eq!(d, data);
                    }
                    other => panic!("seq {seq}: expected a memory write, got {other:?}"),
                }
            }
        }
    }

    // context chains visit exactly the model's per-writer subsequences
    for context_id in 0..3u32 {
        let expected: Vec<u64> = model
            .iter()
            .enumerate()
            .filter(|(_, r)| match r {
                Recorded::Cpu { writer_id, .. } => *writer_id == context_id,
                Recorded::MemoryWrite { writer_id, .. } => *writer_id == context_id,
            })
            .map(|(seq, _)| seq as u64)
            .collect();
        let mut walked = Vec::new();
        let mut seq = file.context(context_id).unwrap().first.seq;
        while seq != INVALID_TRACE_FRAME_ID {
            walked.push(seq);
            seq = file.next_in_context(seq);
        }
        assert_eq!(walked, expected, "context {context_id}");
    }
}

#[test]
fn memory_history_matches_a_replay_of_the_writes() {
    let bank = bank();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.rtrc");

    let mut rng = SmallRng::seed_from_u64(99);
    // (seq, address, bytes), replayed below to predict slice contents
    let mut writes: Vec<(u64, u64, Vec<u8>)> = Vec::new();
    {
        let sink = TraceSink::create(&bank, File::create(&path).unwrap()).unwrap();
        let writer = sink.create_writer(3);
        for seq in 0..200u64 {
            let address = 0x2000 + rng.gen_range(0..32);
            let data: Vec<u8> = (0..rng.gen_range(1..4)).map(|_| rng.gen()).collect();
            writer.add_memory_write(0, address, &data, "bus");
            writes.push((seq, address, data));
        }
    }

    let file = build_from(&path, &bank);
    let slice_start = 0x2000u64;
    let slice_end = 0x2000 + 40;
    let mut slice = file.memory_slice(slice_start, slice_end).unwrap();

    for &probe in &[0u64, 17, 63, 128, 199, 1000] {
        slice.rewind(probe);
        let mut expected = vec![0u8; (slice_end - slice_start) as usize];
        for &(seq, address, ref data) in &writes {
            if seq > probe {
                break;
            }
            for (i, &value) in data.iter().enumerate() {
                let target = address + i as u64 - slice_start;
                if (target as usize) < expected.len() {
                    expected[target as usize] = value;
                }
            }
        }
        assert_eq!(slice.bytes(), expected, "rewind to {probe}");
    }
}

#[test]
fn concurrent_writers_interleave_into_one_dense_sequence() {
    let bank = bank();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.rtrc");

    const THREADS: u32 = 4;
    const FRAMES: u64 = 500;
    {
        let sink = TraceSink::create(&bank, File::create(&path).unwrap()).unwrap();
        let frame_size = bank.frame_size() as usize;
        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let writer = sink.create_writer(10 + t);
                scope.spawn(move || {
                    let mut snapshot = vec![0u8; frame_size];
                    for i in 0..FRAMES {
                        snapshot[..8].copy_from_slice(&i.to_le_bytes());
                        writer.add_frame(0x1000 + u64::from(t) * 0x1_0000 + i * 4, &snapshot);
                    }
                });
            }
        });
    }

    let mut file = build_from(&path, &bank);
    assert_eq!(file.num_entries(), u64::from(THREADS) * FRAMES);

    // every sequence number is assigned exactly once
    for seq in 0..file.num_entries() {
        assert_eq!(file.entry(seq).unwrap().kind, FrameKind::CpuInstruction);
    }

    // each context holds its own frames, in recording order
    for context_id in 0..THREADS {
        let context = file.context(context_id).unwrap();
        assert_eq!(context.num_frames(), FRAMES as u32);
        let mut seq = context.first.seq;
        let mut count = 0u64;
        while seq != INVALID_TRACE_FRAME_ID {
            let frame = file.frame(seq);
            let mut r0 = [0u8; 8];
            r0.copy_from_slice(&frame.registers().unwrap()[..8]);
            assert_eq!(u64::from_le_bytes(r0), count);
            count += 1;
            seq = file.next_in_context(seq);
        }
        assert_eq!(count, FRAMES);
    }
}

#[test]
fn a_truncated_capture_still_indexes_its_prefix() {
    let bank = bank();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.rtrc");

    let frame_size = bank.frame_size() as usize;
    {
        let sink = TraceSink::create(&bank, File::create(&path).unwrap()).unwrap();
        let writer = sink.create_writer(5);
        let snapshot = vec![0x11u8; frame_size];
        for i in 0..100u64 {
            writer.add_frame(0x1000 + i * 4, &snapshot);
        }
        // land the first batch in a complete block before recording more
        sink.flush();
        for i in 100..200u64 {
            writer.add_frame(0x1000 + i * 4, &snapshot);
        }
    }

    let full_len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(full_len - 7).unwrap();
    drop(file);

    let mut indexed = build_from(&path, &bank);
    let complete: Vec<u64> = (0..indexed.num_entries())
        .filter(|&seq| !indexed.frame(seq).is_empty())
        .collect();
    assert!(complete.len() >= 100, "first block must survive");
    assert!(complete.len() < 200, "the damaged tail must be dropped");
    for &seq in &complete {
        let frame = indexed.frame(seq);
        assert_eq!(frame.ip, 0x1000 + seq * 4);
        assert_eq!(frame.registers().unwrap(), &vec![0x11u8; frame_size][..]);
    }
}

struct BranchTable;

impl InstructionClassifier for BranchTable {
    fn classify(&self, ip: u64) -> ControlFlow {
        match ip {
            0x1008 => ControlFlow::Call {
                target: Some(0x2000),
            },
            0x200C => ControlFlow::Return,
            _ => ControlFlow::Plain,
        }
    }
}

#[test]
fn call_tree_is_built_during_indexing() {
    let bank = bank();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.rtrc");

    let script = [
        0x1000u64, 0x1004, 0x1008, // call
        0x2000, 0x2004, 0x2008, 0x200C, // callee, returns
        0x100C, 0x1010,
    ];
    {
        let sink = TraceSink::create(&bank, File::create(&path).unwrap()).unwrap();
        let writer = sink.create_writer(2);
        let snapshot = vec![0u8; bank.frame_size() as usize];
        for ip in script {
            writer.add_frame(ip, &snapshot);
        }
    }

    let mut reader = RawTraceReader::open(&path, &bank).unwrap();
    let file = DataFile::build(&mut reader, &BranchTable, &mut ()).unwrap();

    let inside = file.innermost_call(4).unwrap();
    assert_eq!(inside.function_start, 0x2000);
    assert_eq!(inside.enter.seq, 2);
    assert_eq!(inside.leave.seq, 6);

    let outside = file.innermost_call(7).unwrap();
    assert_eq!(outside.enter.seq, 0);
    assert_eq!(outside.leave.seq, script.len() as u64 - 1);
}

#[test]
fn indexing_can_reuse_the_builder_directly() {
    // DataBuilder is public so frontends can index without a DataFile,
    // make sure the exported arrays line up with what build() would use
    let bank = bank();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.rtrc");
    {
        let sink = TraceSink::create(&bank, File::create(&path).unwrap()).unwrap();
        let writer = sink.create_writer(4);
        writer.add_frame(0x1000, &vec![1u8; bank.frame_size() as usize]);
        writer.add_frame(0x1004, &vec![2u8; bank.frame_size() as usize]);
    }

    let mut reader = RawTraceReader::open(&path, &bank).unwrap();
    let mut builder = DataBuilder::new(&bank, &NoControlFlow);
    reader.scan(&mut builder, &mut ()).unwrap();
    let data = builder.finish();
    assert_eq!(data.entries.len(), 2);
    assert_eq!(data.contexts.len(), 1);
    assert_eq!(data.call_frames.len(), 2);
}

use prost::Message;
use shared::constants::{record_size, RECORD_ALIGN};
use shared::events::{
    kernel_record::Payload, Credentials, ExecPayload, FileInfo, FileStat, KernelRecord,
    RecordKind,
};

fn exec_record() -> KernelRecord {
    KernelRecord {
        kind: RecordKind::Exec as i32,
        pid: 100,
        ts: Some(prost_types::Timestamp { seconds: 1_700_000_000, nanos: 5 }),
        subject: Some(Credentials {
            auid: 501,
            euid: 0,
            egid: 0,
            ruid: 501,
            rgid: 20,
            sid: 100,
            tty: u64::MAX,
            addr: String::new(),
        }),
        authorize: true,
        payload: Some(Payload::Exec(ExecPayload {
            image: Some(FileInfo {
                path: "/tmp/a.sh".into(),
                stat: Some(FileStat { dev: 1, ino: 42, mode: 0o100755, size: 12, ..Default::default() }),
            }),
            argv: vec!["/tmp/a.sh".into(), "-x".into()],
            env: vec!["PATH=/bin".into()],
            cwd: "/tmp".into(),
            interpreter_pending: true,
        })),
    }
}

#[test]
fn exec_record_survives_the_wire() {
    let original = exec_record();
    let bytes = original.encode_to_vec();
    let decoded = KernelRecord::decode(bytes.as_slice()).expect("decode failed");

    assert_eq!(decoded.kind(), RecordKind::Exec);
    assert!(decoded.authorize);
    match decoded.payload {
        Some(Payload::Exec(exec)) => {
            assert!(exec.interpreter_pending);
            assert_eq!(exec.argv, vec!["/tmp/a.sh", "-x"]);
            let stat = exec.image.and_then(|i| i.stat).expect("stat missing");
            assert_eq!((stat.dev, stat.ino), (1, 42));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn unknown_kind_falls_back_to_unspecified() {
    let mut rec = exec_record();
    rec.kind = 999;
    let decoded = KernelRecord::decode(rec.encode_to_vec().as_slice()).unwrap();
    assert_eq!(decoded.kind(), RecordKind::Unspecified);
}

#[test]
fn record_sizes_are_aligned() {
    for len in [0usize, 1, 3, 4, 5, 100] {
        let size = record_size(len);
        assert_eq!(size % RECORD_ALIGN, 0);
        assert!(size >= len + 4);
        assert!(size < len + 4 + RECORD_ALIGN);
    }
}

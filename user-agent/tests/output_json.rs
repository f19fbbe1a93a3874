// tests/output_json.rs

use agent::comms::events::{FileOp, Subject};
use agent::config::Config;
use agent::output::{
    names::NameResolver, spawn_writer, EventCode, Handlers, LogQueue, WriterStats,
};
use agent::pipeline::{
    model::{Event, EventBody, ProcessRef},
    stats::QueueStats,
};
use chrono::Utc;
use std::sync::Arc;
use tempfile::tempdir;

struct Fixed;

impl NameResolver for Fixed {
    fn user(&self, uid: u32) -> Option<Arc<str>> {
        (uid == 501).then(|| Arc::from("alice"))
    }

    fn group(&self, _gid: u32) -> Option<Arc<str>> {
        None
    }
}

fn file_event() -> Event {
    Event {
        ts: Utc::now(),
        body: EventBody::FileAccess {
            subject: ProcessRef {
                pid: 42,
                subject: Subject { auid: Some(501), euid: 501, ruid: 501, ..Default::default() },
                image: None,
                ancestors: Vec::new(),
                reconstructed: false,
            },
            op: FileOp::Unlink,
            path: "/tmp/gone \"quoted\"".into(),
            new_path: None,
        },
    }
}

#[tokio::test]
async fn writer_appends_one_json_object_per_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let mut cfg = Config::default();
    cfg.output.destination = path.display().to_string();

    let stats = Arc::new(WriterStats::default());
    let (queue, rx) = LogQueue::new(16, Arc::new(QueueStats::default()));
    let writer = spawn_writer(rx, &cfg.output, Some(Arc::new(Fixed) as Arc<dyn NameResolver>), Arc::clone(&stats))
        .await
        .unwrap();

    let h = Handlers::new(&cfg.output);
    assert!(queue.offer(h.agent_ops("start", &cfg, Utc::now())));
    assert!(queue.offer(h.build(&file_event())));
    assert!(queue.offer(h.agent_stats(&serde_json::json!({"prep_queue": {"drop": 0}}), Utc::now())));
    drop(queue);
    writer.await.unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> =
        text.lines().map(|l| serde_json::from_str(l).expect("each line is JSON")).collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["eventcode"], EventCode::AgentOps as u64);
    assert_eq!(lines[1]["eventcode"], EventCode::FileAccess as u64);
    assert_eq!(lines[1]["path"], "/tmp/gone \"quoted\"");
    assert_eq!(lines[1]["op"], "unlink");
    assert_eq!(lines[1]["subject"]["euid"], 501);
    assert_eq!(lines[1]["subject"]["euname"], "alice");
    assert_eq!(lines[1]["subject"]["auname"], "alice");
    assert_eq!(lines[2]["prep_queue"]["drop"], 0);

    assert_eq!(stats.count(EventCode::FileAccess), 1);
    assert_eq!(stats.count(EventCode::AgentOps), 1);
    assert_eq!(stats.errors.get(), 0);
}

//! Loading brokers from definition files.

#![allow(clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::Arc;

use jobbroker_queue::{BrokerError, FactoryError, MemoryStore, NoWorker, Registry, Worker, load};
use serde_json::{Value, json};

fn registry() -> Registry {
    Registry::new().with_memory_store(MemoryStore::new())
}

fn write_definition(name: &str, definition: &Value) -> PathBuf {
    write_raw(name, &definition.to_string())
}

fn write_raw(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("jobbroker-bootstrap-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}.json"));
    std::fs::write(&path, contents).unwrap();
    path
}

fn memory_queue(name: &str) -> Value {
    json!({
        "queue-module": "memoryqueue",
        "queue-name": name,
        "queue-settings": { "polling-interval": 100, "invisibility-timeout": 30 }
    })
}

fn entry(job_type: &str, queue: Value) -> Value {
    json!({
        "job-type": job_type,
        "worker": { "worker-module": "noworker" },
        "queue": queue
    })
}

fn load_error(name: &str, definition: &Value) -> BrokerError {
    load(write_definition(name, definition), &registry()).unwrap_err()
}

#[test]
fn test_loads_valid_definition() {
    let definition = json!({
        "workers": [
            entry("sendmsg", memory_queue("Q1")),
            {
                "job-type": "SendMail",
                "worker": { "worker-module": "console-settings", "worker-settings": { "name": "mail" } },
                "queue": memory_queue("q2")
            }
        ]
    });
    let broker = load(write_definition("valid", &definition), &registry()).unwrap();

    assert_eq!(broker.queues().len(), 2);
    let mut job_types: Vec<&str> = broker.job_types().collect();
    job_types.sort_unstable();
    assert_eq!(job_types, vec!["sendmail", "sendmsg"]);

    let queue = &broker.queues_for("SENDMSG")[0];
    assert_eq!(queue.info().name, "q1");
    assert_eq!(queue.info().worker_number, 1);
    assert_eq!(broker.queues_for("sendmail")[0].info().worker_number, 2);
}

#[test]
fn test_file_errors() {
    let missing = load("/no/such/broker.json", &registry()).unwrap_err();
    assert_eq!(missing.code(), "FILE_NOT_FOUND");

    let broken = load(write_raw("broken", "{ \"workers\": "), &registry()).unwrap_err();
    assert_eq!(broken.code(), "JSON_PARSE_ERROR");
}

#[test]
fn test_workers_node_errors() {
    assert_eq!(load_error("no-workers", &json!({})).code(), "NO_WORKERS_ARRAY");
    assert_eq!(
        load_error("empty-workers", &json!({ "workers": [] })).code(),
        "WORKERS_ARRAY_EMPTY"
    );
}

#[test]
fn test_entry_errors() {
    let cases = [
        ("job-type", json!({ "worker": { "worker-module": "noworker" } }), "JOB_TYPE_MISSING"),
        ("blank-job-type", json!({ "job-type": "  " }), "JOB_TYPE_MISSING"),
        ("worker-node", json!({ "job-type": "a" }), "NO_WORKER_NODE"),
        ("worker-module", json!({ "job-type": "a", "worker": {} }), "WORKER_MODULE_MISSING"),
        (
            "unknown-worker",
            json!({ "job-type": "a", "worker": { "worker-module": "nosuchworker" } }),
            "UNABLE_TO_LOAD_WORKER_MODULE",
        ),
        (
            "worker-init",
            json!({ "job-type": "a", "worker": { "worker-module": "console-settings" } }),
            "UNABLE_TO_INITIALIZE_WORKER_MODULE",
        ),
        (
            "queue-node",
            json!({ "job-type": "a", "worker": { "worker-module": "noworker" } }),
            "QUEUE_NODE_MISSING",
        ),
        ("queue-module", entry("a", json!({ "queue-name": "q" })), "QUEUE_MODULE_MISSING"),
        ("queue-name", entry("a", json!({ "queue-module": "memoryqueue" })), "QUEUE_NAME_MISSING"),
        (
            "bad-name",
            entry("a", json!({ "queue-module": "memoryqueue", "queue-name": "my-queue" })),
            "INVALID_QUEUE_NAME",
        ),
        ("long-name", entry("a", memory_queue("abcdefghij123456")), "INVALID_QUEUE_NAME"),
        (
            "queue-kind",
            entry("a", json!({ "queue-module": "nosuchqueue", "queue-name": "q" })),
            "UNABLE_TO_LOAD_QUEUE_MODULE",
        ),
        (
            "queue-init",
            entry("a", json!({ "queue-module": "memoryqueue", "queue-name": "q" })),
            "UNABLE_TO_INITIALIZE_QUEUE_MODULE",
        ),
        (
            "redis-init",
            entry(
                "a",
                json!({
                    "queue-module": "redisqueue",
                    "queue-name": "q",
                    "queue-settings": { "polling-interval": 100, "invisibility-timeout": 30 }
                }),
            ),
            "UNABLE_TO_INITIALIZE_QUEUE_MODULE",
        ),
    ];

    for (name, worker_entry, code) in cases {
        let error = load_error(name, &json!({ "workers": [worker_entry] }));
        assert_eq!(error.code(), code, "case {name}: {error}");
    }
}

#[test]
fn test_errors_name_the_entry() {
    let definition = json!({
        "workers": [entry("a", memory_queue("q1")), { "job-type": "b" }]
    });
    assert_eq!(
        load_error("second-entry", &definition),
        BrokerError::ConfigWorkerNodeMissing(2)
    );
}

#[test]
fn test_checks_run_in_order() {
    // Worker problems are reported before queue problems.
    let definition = json!({
        "workers": [{ "job-type": "a", "worker": { "worker-module": "nosuchworker" } }]
    });
    assert_eq!(
        load_error("order-worker", &definition).code(),
        "UNABLE_TO_LOAD_WORKER_MODULE"
    );

    // Name validation happens before the queue module is resolved.
    let definition = json!({
        "workers": [entry("a", json!({ "queue-module": "nosuchqueue", "queue-name": "bad name" }))]
    });
    assert_eq!(load_error("order-queue", &definition).code(), "INVALID_QUEUE_NAME");
}

#[test]
fn test_queue_defined_twice() {
    let definition = json!({
        "workers": [entry("a", memory_queue("shared")), entry("b", memory_queue("SHARED"))]
    });
    let error = load_error("twice", &definition);
    assert_eq!(error.code(), "QUEUE_DEFINED_TWICE");
}

#[test]
fn test_custom_worker_module() {
    let mut registry = registry();
    registry.register_worker("mailer", |settings: &Value| -> Result<Arc<dyn Worker>, FactoryError> {
        if settings.get("smtp").is_none() {
            return Err("smtp must be set".into());
        }
        Ok(Arc::new(NoWorker))
    });

    let ok = json!({
        "workers": [{
            "job-type": "mail",
            "worker": { "worker-module": "Mailer", "worker-settings": { "smtp": "localhost" } },
            "queue": memory_queue("mail")
        }]
    });
    assert!(load(write_definition("custom-ok", &ok), &registry).is_ok());

    let bad = json!({
        "workers": [{
            "job-type": "mail",
            "worker": { "worker-module": "mailer" },
            "queue": memory_queue("mail")
        }]
    });
    let error = load(write_definition("custom-bad", &bad), &registry).unwrap_err();
    assert_eq!(error.code(), "UNABLE_TO_INITIALIZE_WORKER_MODULE");
    assert!(error.to_string().contains("smtp must be set"));
}

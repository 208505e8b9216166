//! Two devices sharing todo lists through a remote
//!
//! ```bash
//! cargo run --example todos
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lofi_core::{
    CollectionSchema, DatabaseConfig, FieldDescriptor, LiveEvent, Query, ResultChange, Selector, SortOrder,
};
use lofi_replication::{MemoryRemote, Remote, Replication, ReplicationConfig};
use lofi_storage::{MemoryStorage, Persister, Storage};

fn config() -> DatabaseConfig {
    DatabaseConfig::new("todosdb")
        .password("sudoLetMeIn")
        .collection(
            CollectionSchema::new("todos")
                .field(FieldDescriptor::string("id").required().max_length(100))
                .field(FieldDescriptor::string("name").required())
                .field(FieldDescriptor::boolean("done").required())
                .field(FieldDescriptor::datetime("timestamp").required()),
        )
        .collection(
            CollectionSchema::new("list")
                .field(FieldDescriptor::string("id").required().max_length(100))
                .field(FieldDescriptor::string("description").encrypted())
                .field(FieldDescriptor::string("list_id").required().references("todos")),
        )
}

async fn device(remote: &Arc<MemoryRemote>) -> anyhow::Result<(Arc<Persister>, Vec<Arc<Replication>>)> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let persister = Persister::open(config(), storage).await?;
    persister.database().set_local("token", json!("demo-token"))?;

    let mut replications = Vec::new();
    for name in ["todos", "list"] {
        let replication = Replication::builder(persister.clone(), name, Remote::from_handler("demo", remote.clone()))
            .config(ReplicationConfig {
                cycle_interval: Duration::from_millis(200),
                ..Default::default()
            })
            .build()
            .await?;
        replications.push(replication);
    }
    Ok((persister, replications))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let remote = Arc::new(MemoryRemote::new().with_token("demo-token"));
    let (laptop, laptop_sync) = device(&remote).await?;
    let (phone, phone_sync) = device(&remote).await?;

    let mut handles = Vec::new();
    for replication in laptop_sync.iter().chain(phone_sync.iter()) {
        handles.push(replication.clone().spawn(None));
    }

    // The phone watches open todos, newest first
    let phone_todos = phone.database().collection("todos")?;
    let mut open_todos = phone_todos.subscribe(
        Query::new(Selector::eq("done", false)).sort_by("timestamp", SortOrder::Desc),
    );
    if let Some(LiveEvent::Initial { documents, .. }) = open_todos.next().await {
        info!(count = documents.len(), "Phone starts with open todos");
    }

    // The laptop writes a list with an encrypted entry
    let todos = laptop.database().collection("todos")?;
    let list = laptop.database().collection("list")?;
    todos.insert(json!({
        "id": "groceries",
        "name": "Groceries",
        "done": false,
        "timestamp": "2024-05-01T10:00:00Z"
    }))?;
    list.insert(json!({"id": "milk", "description": "2 litres of oat milk", "list_id": "groceries"}))?;

    let arrived = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = open_todos.next().await {
            if let LiveEvent::Delta { sequence, changes } = event {
                for change in changes {
                    if let ResultChange::Added(doc) = change {
                        info!(sequence, id = %doc.id, "Phone sees new todo");
                        return true;
                    }
                }
            }
        }
        false
    })
    .await?;
    anyhow::ensure!(arrived, "todo never reached the phone");

    // Wait until both devices have nothing left to push
    for replication in laptop_sync.iter().chain(phone_sync.iter()) {
        tokio::time::timeout(Duration::from_secs(5), replication.await_in_sync()).await?;
    }

    // The entry arrives decrypted on the phone and resolves its list
    let phone_list = phone.database().collection("list")?;
    if let Some(entry) = phone_list.find_one("milk") {
        let owners = phone.database().populate("list", &entry, "list_id")?;
        info!(
            description = ?entry.get("description"),
            list = ?owners.first().and_then(|d| d.get("name")),
            "Phone resolved list entry"
        );
    }

    // Marking everything done empties the phone's live query
    phone_todos.patch_where(&Selector::eq("done", false), json!({"done": true}))?;
    info!(open = phone_todos.count(&Selector::eq("done", false)), "Phone finished all todos");

    // UI state stays on the phone
    let ui = phone.database().add_state("ui")?;
    let finished = ui.modify("finishedRounds", |current| {
        json!(current.and_then(|v| v.as_u64()).unwrap_or(0) + 1)
    })?;
    info!(%finished, "Phone state updated");

    laptop.database().close();
    phone.database().close();
    for handle in handles {
        handle.await??;
    }
    info!(
        conflicts = laptop_sync.iter().map(|r| r.conflicts().len()).sum::<usize>(),
        remote_todos = remote.documents("todos").len(),
        "Done"
    );
    Ok(())
}

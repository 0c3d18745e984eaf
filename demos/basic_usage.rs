use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use mvcc_cache_index::impls::memory_client::MemoryClient;
use mvcc_cache_index::Coordinator;
use mvcc_cache_index::IOResultStream;
use mvcc_cache_index::LocalClient;
use mvcc_cache_index::ObjectMover;
use mvcc_cache_index::Oid;
use mvcc_cache_index::Polled;
use mvcc_cache_index::PolledChanges;
use mvcc_cache_index::Poller;
use mvcc_cache_index::Tid;
use mvcc_cache_index::Viewer;
use parking_lot::Mutex;

/// A database that only remembers which transaction last wrote each object.
#[derive(Default)]
struct Database {
    current_tid: Mutex<Tid>,
    objects: Mutex<BTreeMap<Oid, Tid>>,
}

impl Database {
    fn commit(&self, oids: &[Oid]) -> Tid {
        let mut tid = self.current_tid.lock();
        *tid += 1;
        let mut objects = self.objects.lock();
        for oid in oids {
            objects.insert(*oid, *tid);
        }
        *tid
    }
}

#[async_trait]
impl Poller for Database {
    type Cursor = ();

    async fn get_current_tid(&self, _cursor: &mut ()) -> Result<Tid, io::Error> {
        Ok(*self.current_tid.lock())
    }

    async fn poll_invalidations(
        &self,
        _cursor: &mut (),
        prev_polled_tid: Tid,
    ) -> Result<Option<PolledChanges>, io::Error> {
        let tid = *self.current_tid.lock();
        let changes: Vec<_> = self
            .objects
            .lock()
            .iter()
            .filter(|(_oid, t)| **t > prev_polled_tid)
            .map(|(oid, t)| (*oid, *t))
            .collect();
        Ok(Some(PolledChanges::new(changes, tid)))
    }
}

#[async_trait]
impl ObjectMover for Database {
    async fn current_object_tids(
        &self,
        oids: &[Oid],
    ) -> Result<IOResultStream<(Oid, Tid)>, io::Error> {
        let objects = self.objects.lock();
        let rows = oids
            .iter()
            .filter_map(|oid| objects.get(oid).map(|tid| Ok((*oid, *tid))))
            .collect::<Vec<_>>();
        Ok(futures::stream::iter(rows).boxed())
    }
}

fn report(name: &str, polled: &Polled) {
    match polled {
        Polled::Changes(changes) => println!("{}: changed {:?}", name, changes),
        Polled::InvalidateAll => println!("{}: invalidate everything", name),
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let db = Database::default();
    db.commit(&[1, 2, 3]);

    let cache: Arc<dyn LocalClient> = Arc::new(MemoryClient::default());
    let coordinator = Coordinator::default();

    let reader = Arc::new(Viewer::new(cache.clone()));
    let writer = Arc::new(Viewer::new(cache.clone()));
    coordinator.register(&reader);
    coordinator.register(&writer);

    report("reader", &coordinator.poll(&reader, &db, &mut ()).await?);
    report("writer", &coordinator.poll(&writer, &db, &mut ()).await?);

    // The reader loads object 1 and caches it.
    reader.store_cached(1, 1, b"first version".to_vec());

    // The writer changes object 1 and 2; it does not need to hear about its own commit.
    let tid = db.commit(&[1, 2]);
    writer.after_commit(tid);

    report("writer", &coordinator.poll(&writer, &db, &mut ()).await?);
    report("reader", &coordinator.poll(&reader, &db, &mut ()).await?);

    println!("reader sees object 1 at tid {:?}", reader.lookup(1));
    println!("shared chain depth: {:?}", coordinator.object_index().map(|ix| ix.depth()));

    // A cache that survived a restart is checked against the database.
    cache.set(3, 1, b"third".to_vec());
    let restored = coordinator.restore(&db, cache.as_ref(), None).await?;
    println!(
        "restore: verified {:?}, invalid {:?}",
        restored.verified, restored.invalid
    );

    coordinator.unregister(&reader);
    coordinator.unregister(&writer);
    Ok(())
}

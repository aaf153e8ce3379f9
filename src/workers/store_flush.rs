use crate::store::Store;

pub async fn run(store: &Store) {
    if let Err(e) = store.flush() {
        tracing::error!(error = %e, "store_flush failed");
    }
}

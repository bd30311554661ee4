#[macro_use]
extern crate afl;
use vault_e2ee::{
    Account, AccountConfig, Envelope, MemorySessionStore, SessionEngine, StorageKey,
};

type Victim = Account<MemorySessionStore>;

async fn account(user_id: &str) -> Victim {
    Account::create(
        user_id,
        1,
        MemorySessionStore::new(),
        StorageKey::from_bytes([0u8; 32]),
        AccountConfig::default(),
    )
    .await
    .expect("Setup failed")
}

async fn established() -> Victim {
    // The Victim
    let alice = account("alice").await;

    // The Attacker context
    let bob = account("bob").await;
    let bundle = bob.current_bundle().expect("Setup failed");

    alice
        .initiate_session("bob", &bundle)
        .await
        .expect("Setup failed");
    alice.encrypt("bob", 1, b"hello").await.expect("Setup failed");

    alice
}

fn main() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("Setup failed");
    let alice = runtime.block_on(established());

    fuzz!(|data: &[u8]| {
        if let Ok(envelope) = Envelope::decode(data) {
            let _ = runtime.block_on(alice.decrypt("bob", 1, &envelope));
        }
    });
}

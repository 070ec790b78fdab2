//! Randomized transfers on the in-memory store
//!
//! Whatever the mix of directions, amounts and failures, money is neither
//! created nor destroyed and no balance ends up negative.

use std::sync::Arc;
use std::time::Duration;

use simple_bank::ledger::{
    Account, CreateAccountParams, CreateUserParams, LedgerError, MemoryStore, Store,
    TransferEngine, TransferTxParams,
};
use simple_bank::{Currency, random};

async fn open_account(store: &MemoryStore, balance: i64) -> Account {
    let user = store
        .create_user(CreateUserParams {
            username: random::random_string(12),
            hashed_password: random::random_token(32),
            full_name: random::random_owner(),
            email: format!("{}@email.com", random::random_string(12)),
        })
        .await
        .unwrap();

    store
        .create_account(CreateAccountParams {
            owner: user.username,
            balance,
            currency: Currency::Cad,
        })
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_random_concurrent_transfers_conserve_money() {
    let store = Arc::new(MemoryStore::new());
    let engine = TransferEngine::new(store.clone());

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(open_account(&store, 500).await.id);
    }

    let mut handles = Vec::new();
    for _ in 0..200 {
        let from = ids[random::random_int(0, 5) as usize];
        let mut to = ids[random::random_int(0, 5) as usize];
        if to == from {
            to = *ids.iter().find(|&&id| id != from).unwrap();
        }
        let amount = random::random_int(1, 120);
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .transfer(TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount,
                })
                .await
        }));
    }

    let results = tokio::time::timeout(
        Duration::from_secs(20),
        futures::future::join_all(handles),
    )
    .await
    .expect("transfers deadlocked");

    let mut committed = 0;
    for r in results {
        match r.unwrap() {
            Ok(_) => committed += 1,
            // overdrafts are expected with random amounts
            Err(e) => assert!(
                matches!(e, LedgerError::InsufficientBalance { .. }),
                "unexpected error: {}",
                e
            ),
        }
    }

    let mut total = 0;
    for id in &ids {
        let balance = store.get_account(*id).await.unwrap().balance;
        assert!(balance >= 0, "account {} overdrawn: {}", id, balance);
        total += balance;
    }

    assert_eq!(total, 6 * 500);
    assert_eq!(store.transfer_count(), committed);
    assert_eq!(store.entry_count(), committed * 2);
}

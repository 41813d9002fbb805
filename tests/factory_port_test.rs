use payrecon::domain::money::{Amount, Currency};
use payrecon::domain::ports::{InsertOutcome, PaymentStoreBox, PaymentStoreFactory};
use payrecon::domain::transaction::{PaymentMethod, PaymentTransaction};
use payrecon::infrastructure::in_memory::InMemoryPaymentStore;
use rust_decimal_macros::dec;

fn payment(order: &str) -> PaymentTransaction {
    PaymentTransaction::new(
        order,
        PaymentMethod::WalletB,
        Amount::new(dec!(20)).unwrap(),
        Currency::Bdt,
    )
}

#[tokio::test]
async fn test_factory_instantiation() {
    let factory: PaymentStoreFactory =
        Box::new(|| Box::new(InMemoryPaymentStore::new()) as PaymentStoreBox);

    let store = factory();
    let tx = payment("ORD-1");

    // Verify it works
    assert_eq!(store.insert(tx.clone()).await.unwrap(), InsertOutcome::Inserted);
    let retrieved = store.get(tx.id).await.unwrap().unwrap();
    assert_eq!(retrieved.order_reference, "ORD-1");
}

#[tokio::test]
async fn test_factory_stores_are_independent() {
    let factory: PaymentStoreFactory =
        Box::new(|| Box::new(InMemoryPaymentStore::new()) as PaymentStoreBox);

    let handle = tokio::spawn(async move {
        let first = factory();
        let second = factory();
        first.insert(payment("ORD-2")).await.unwrap();
        // The open attempt in `first` does not block `second`.
        second.insert(payment("ORD-2")).await.unwrap()
    });

    assert_eq!(handle.await.unwrap(), InsertOutcome::Inserted);
}

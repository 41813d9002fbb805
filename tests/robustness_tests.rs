use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn test_malformed_script_handling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("robustness_test.csv");
    let mut wtr = csv::Writer::from_path(&path).unwrap();
    wtr.write_record(["op", "reference", "method", "amount", "currency", "detail"])
        .unwrap();

    // Valid payment
    wtr.write_record(["create", "ORD-1", "cash_on_delivery", "10", "BDT", ""])
        .unwrap();
    // Unknown op
    wtr.write_record(["teleport", "ORD-1", "", "", "", ""]).unwrap();
    // Unknown method
    wtr.write_record(["create", "ORD-2", "barter", "10", "BDT", ""])
        .unwrap();
    // Text in amount field
    wtr.write_record(["create", "ORD-3", "card", "lots", "BDT", ""])
        .unwrap();
    // Valid payment again
    wtr.write_record(["create", "ORD-4", "cash_on_delivery", "20", "BDT", ""])
        .unwrap();
    wtr.flush().unwrap();
    drop(wtr);

    let mut cmd = Command::new(cargo_bin!("payrecon"));
    cmd.arg(&path);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Error reading command"))
        .stdout(predicate::str::contains("ORD-1,cash_on_delivery,completed,10,0,BDT"))
        .stdout(predicate::str::contains("ORD-4,cash_on_delivery,completed,20,0,BDT"))
        .stdout(predicate::str::contains("ORD-2").not())
        .stdout(predicate::str::contains("ORD-3").not());
}

#[test]
fn test_business_errors_do_not_stop_the_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("business_errors.csv");
    let mut wtr = csv::Writer::from_path(&path).unwrap();
    wtr.write_record(["op", "reference", "method", "amount", "currency", "detail"])
        .unwrap();

    // Above the cash-on-delivery limit
    wtr.write_record(["create", "ORD-1", "cash_on_delivery", "999999", "BDT", ""])
        .unwrap();
    // Currency not accepted by wallet A
    wtr.write_record(["create", "ORD-2", "wallet_a", "10", "USD", ""])
        .unwrap();
    // Refund on a payment that never settled
    wtr.write_record(["create", "ORD-3", "wallet_a", "10", "BDT", ""])
        .unwrap();
    wtr.write_record(["refund", "ORD-3", "", "5", "", "early"])
        .unwrap();
    // Wallet B does not refund
    wtr.write_record(["create", "ORD-4", "wallet_b", "50", "BDT", ""])
        .unwrap();
    wtr.write_record(["settle", "ORD-4", "", "", "", "completed"])
        .unwrap();
    wtr.write_record(["verify", "ORD-4", "", "", "", ""]).unwrap();
    wtr.write_record(["refund", "ORD-4", "", "5", "", "nope"])
        .unwrap();
    wtr.flush().unwrap();
    drop(wtr);

    let mut cmd = Command::new(cargo_bin!("payrecon"));
    cmd.arg(&path);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("invalid amount 999999"))
        .stderr(predicate::str::contains("currency USD is not accepted by wallet_a"))
        .stderr(predicate::str::contains("is processing; operation not allowed"))
        .stderr(predicate::str::contains("payment method wallet_b does not support refunds"))
        .stdout(predicate::str::contains("ORD-3,wallet_a,processing,10,0,BDT"))
        .stdout(predicate::str::contains("ORD-4,wallet_b,completed,50,0,BDT"));
}

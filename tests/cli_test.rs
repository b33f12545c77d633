use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg("tests/fixtures/accounts.csv")
        .arg("tests/fixtures/transfers.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::starts_with("account,owner,balance,currency\n"))
        .stdout(predicate::str::contains("1,alice,750,USD"))
        .stdout(predicate::str::contains("2,bob,750,USD"))
        .stdout(predicate::str::contains("3,alice,2100,EUR"))
        .stdout(predicate::str::contains("4,carol,200,EUR"))
        // Unsupported currency: never opened
        .stdout(predicate::str::contains("dave").not())
        .stderr(predicate::str::contains("Error reading account"))
        .stderr(predicate::str::contains("currency mismatch"))
        .stderr(predicate::str::contains("cannot transfer to the same account"))
        .stderr(predicate::str::contains("account 9 not found"))
        .stderr(predicate::str::contains("Amount must be positive"))
        .stderr(predicate::str::contains("Error processing transfer").count(5));

    Ok(())
}

#[test]
fn test_cli_rows_are_sorted_by_label() -> Result<(), Box<dyn std::error::Error>> {
    let mut accounts = tempfile::NamedTempFile::new()?;
    writeln!(accounts, "account,owner,balance,currency")?;
    writeln!(accounts, "30,zoe,10,JPY")?;
    writeln!(accounts, "7,yuri,20,JPY")?;
    writeln!(accounts, "12,xena,30,JPY")?;

    let mut transfers = tempfile::NamedTempFile::new()?;
    writeln!(transfers, "from,to,amount")?;

    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(accounts.path()).arg(transfers.path());

    cmd.assert().success().stdout(
        "account,owner,balance,currency\n7,yuri,20,JPY\n12,xena,30,JPY\n30,zoe,10,JPY\n",
    );

    Ok(())
}

#[test]
fn test_cli_json_output() -> Result<(), Box<dyn std::error::Error>> {
    let mut accounts = tempfile::NamedTempFile::new()?;
    writeln!(accounts, "account,owner,balance,currency")?;
    writeln!(accounts, "1,alice,1000,USD")?;
    writeln!(accounts, "2,bob,500,USD")?;

    let mut transfers = tempfile::NamedTempFile::new()?;
    writeln!(transfers, "from,to,amount")?;
    writeln!(transfers, "1,2,300")?;

    let output = Command::new(cargo_bin!())
        .arg(accounts.path())
        .arg(transfers.path())
        .arg("--format")
        .arg("json")
        .output()?;
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(
        rows,
        serde_json::json!([
            {"account": 1, "owner": "alice", "balance": 700, "currency": "USD"},
            {"account": 2, "owner": "bob", "balance": 800, "currency": "USD"},
        ])
    );

    Ok(())
}

#[test]
fn test_cli_many_concurrent_transfers_conserve_money() -> Result<(), Box<dyn std::error::Error>> {
    let mut accounts = tempfile::NamedTempFile::new()?;
    writeln!(accounts, "account,owner,balance,currency")?;
    writeln!(accounts, "1,alice,1000,USD")?;
    writeln!(accounts, "2,bob,1000,USD")?;

    let mut transfers = tempfile::NamedTempFile::new()?;
    writeln!(transfers, "from,to,amount")?;
    for i in 0..200 {
        if i % 2 == 0 {
            writeln!(transfers, "1,2,7")?;
        } else {
            writeln!(transfers, "2,1,7")?;
        }
    }

    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(accounts.path())
        .arg(transfers.path())
        .arg("--workers")
        .arg("16");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("1,alice,1000,USD"))
        .stdout(predicate::str::contains("2,bob,1000,USD"))
        .stderr(predicate::str::contains("Error").not());

    Ok(())
}

#[test]
fn test_cli_rejects_zero_workers() {
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg("tests/fixtures/accounts.csv")
        .arg("tests/fixtures/transfers.csv")
        .arg("--workers")
        .arg("0");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("workers must be at least 1"));
}

#[test]
fn test_cli_missing_input_file_fails() {
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg("does/not/exist.csv").arg("tests/fixtures/transfers.csv");

    cmd.assert().failure();
}

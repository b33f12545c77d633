use clap::{Parser, ValueEnum};
use futures::stream::{self, StreamExt};
use miette::{IntoDiagnostic, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use txledger::application::LedgerStore;
use txledger::config::LedgerConfig;
use txledger::context::TxContext;
use txledger::domain::account::{Account, Amount, CreateAccountParams};
use txledger::domain::ports::TxBackendRef;
use txledger::domain::transfer::TransferTxParams;
use txledger::domain::user::{CreateUserParams, CreateUserTxParams};
use txledger::error::LedgerError;
use txledger::infrastructure::in_memory::InMemoryBackend;
use txledger::interfaces::csv::reader::AccountLabel;
use txledger::interfaces::csv::{
    AccountRecord, AccountRow, AccountWriter, RecordReader, TransferRecord,
};
use txledger::logging::init_logging;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Opening accounts CSV file (account, owner, balance, currency)
    accounts: PathBuf,

    /// Transfers CSV file (from, to, amount)
    transfers: PathBuf,

    /// Output format for the final account balances
    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    #[command(flatten)]
    config: LedgerConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.config.validate().into_diagnostic()?;
    init_logging(&cli.config);

    let store = LedgerStore::new(open_backend(&cli.config).await?);
    let ctx = TxContext::background().with_label("txledger");

    let accounts = open_accounts(&store, &ctx, &cli.accounts).await?;
    run_transfers(&store, &cli.config, &accounts, &cli.transfers).await?;

    // Collect final state
    let mut rows = Vec::with_capacity(accounts.len());
    for (label, account) in &accounts {
        let current = store.get_account(&ctx, account.id).await.into_diagnostic()?;
        rows.push(AccountRow::new(*label, current));
    }

    let stdout = io::stdout();
    match cli.format {
        OutputFormat::Csv => {
            let mut writer = AccountWriter::new(stdout.lock());
            writer.write_accounts(rows).into_diagnostic()?;
        }
        OutputFormat::Json => {
            let mut out = stdout.lock();
            serde_json::to_writer_pretty(&mut out, &rows).into_diagnostic()?;
            writeln!(out).into_diagnostic()?;
        }
    }

    Ok(())
}

#[cfg(feature = "storage-postgres")]
async fn open_backend(config: &LedgerConfig) -> Result<TxBackendRef> {
    use txledger::infrastructure::postgres::PostgresBackend;

    if let Some(url) = &config.database_url {
        let max_connections = u32::try_from(config.workers).unwrap_or(u32::MAX).saturating_add(1);
        let backend = PostgresBackend::connect(url, max_connections, config.lock_wait_timeout())
            .await
            .into_diagnostic()?;
        backend.ensure_schema().await.into_diagnostic()?;
        return Ok(Arc::new(backend));
    }
    Ok(Arc::new(InMemoryBackend::with_lock_wait_timeout(
        config.lock_wait_timeout(),
    )))
}

#[cfg(not(feature = "storage-postgres"))]
async fn open_backend(config: &LedgerConfig) -> Result<TxBackendRef> {
    if config.database_url.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --database-url, but 'storage-postgres' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Arc::new(InMemoryBackend::with_lock_wait_timeout(
        config.lock_wait_timeout(),
    )))
}

/// Creates every account in the opening file, and its owner on first sight.
async fn open_accounts(
    store: &LedgerStore,
    ctx: &TxContext,
    path: &Path,
) -> Result<BTreeMap<AccountLabel, Account>> {
    let file = File::open(path).into_diagnostic()?;
    let reader: RecordReader<_, AccountRecord> = RecordReader::new(file);

    let mut accounts = BTreeMap::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                eprintln!("Error reading account: {}", e);
                continue;
            }
        };
        if accounts.contains_key(&record.account) {
            eprintln!("Error creating account: duplicate label {}", record.account);
            continue;
        }

        match open_account(store, ctx, &record).await {
            Ok(account) => {
                accounts.insert(record.account, account);
            }
            Err(e) => eprintln!("Error creating account: {}", e),
        }
    }
    Ok(accounts)
}

async fn open_account(
    store: &LedgerStore,
    ctx: &TxContext,
    record: &AccountRecord,
) -> Result<Account, LedgerError> {
    match store.get_user(ctx, &record.owner).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            let params = CreateUserParams {
                username: record.owner.clone(),
                // Batch-created owners cannot log in.
                hashed_password: "!".to_string(),
                full_name: record.owner.clone(),
                email: format!("{}@txledger.invalid", record.owner),
            };
            store
                .create_user_tx(
                    ctx,
                    CreateUserTxParams {
                        params,
                        after_create: Box::new(|user| {
                            tracing::info!(username = %user.username, "owner created");
                            Ok(())
                        }),
                    },
                )
                .await?;
        }
        Err(e) => return Err(e),
    }

    store
        .create_account(
            ctx,
            CreateAccountParams {
                owner: record.owner.clone(),
                balance: record.balance,
                currency: record.currency,
            },
        )
        .await
}

/// Checks the caller-side rules the ledger itself does not enforce.
fn validate_transfer(
    accounts: &BTreeMap<AccountLabel, Account>,
    record: &TransferRecord,
) -> Result<TransferTxParams, LedgerError> {
    let from = accounts
        .get(&record.from)
        .ok_or_else(|| LedgerError::not_found("account", record.from))?;
    let to = accounts
        .get(&record.to)
        .ok_or_else(|| LedgerError::not_found("account", record.to))?;

    if from.id == to.id {
        return Err(LedgerError::Validation(
            "cannot transfer to the same account".to_string(),
        ));
    }
    if from.currency != to.currency {
        return Err(LedgerError::Validation(format!(
            "currency mismatch: {} vs {}",
            from.currency, to.currency
        )));
    }

    Ok(TransferTxParams {
        from_account_id: from.id,
        to_account_id: to.id,
        amount: Amount::new(record.amount)?,
    })
}

async fn run_transfers(
    store: &LedgerStore,
    config: &LedgerConfig,
    accounts: &BTreeMap<AccountLabel, Account>,
    path: &Path,
) -> Result<()> {
    let file = File::open(path).into_diagnostic()?;
    let reader: RecordReader<_, TransferRecord> = RecordReader::new(file);

    let mut jobs = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let line = line + 2; // header is line 1
        match record.and_then(|record| validate_transfer(accounts, &record)) {
            Ok(params) => jobs.push((line, params)),
            Err(e) => eprintln!("Error processing transfer: {} (line {})", e, line),
        }
    }

    let tx_timeout = config.tx_timeout();
    let mut results = stream::iter(jobs)
        .map(|(line, params)| {
            let store = store.clone();
            let mut ctx = TxContext::background().with_label(format!("transfer-line-{line}"));
            if let Some(timeout) = tx_timeout {
                ctx = ctx.with_timeout(timeout);
            }
            tokio::spawn(async move { (line, store.transfer_tx(&ctx, params).await) })
        })
        .buffer_unordered(config.workers);

    while let Some(joined) = results.next().await {
        match joined {
            Ok((_, Ok(_))) => {}
            Ok((line, Err(e))) => eprintln!("Error processing transfer: {} (line {})", e, line),
            Err(e) => eprintln!("Error processing transfer: task failed: {}", e),
        }
    }

    Ok(())
}

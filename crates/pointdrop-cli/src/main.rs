// Pointdrop CLI - operator tool for the points ledger and payment gateway

mod fields;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use pointdrop_checkmac::{check_mac_value, sign, verify, MerchantKeys, CHECK_MAC_FIELD};
use serde_json::{json, Value};

/// Pointdrop - points ledger and gateway signing tool
#[derive(Parser)]
#[command(name = "pointdrop")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute or check gateway CheckMacValue signatures
    Checkmac {
        #[command(subcommand)]
        action: CheckmacAction,
    },
    /// Show an account's balance and recent ledger entries
    Balance {
        #[command(flatten)]
        server: ServerArgs,

        /// Account id
        account: String,
    },
    /// Credit (or, with a negative amount, debit) an account
    Recharge {
        #[command(flatten)]
        server: ServerArgs,

        #[arg(long)]
        account: String,

        /// Points to credit
        #[arg(long, allow_hyphen_values = true)]
        amount: i64,

        #[arg(long, default_value = "")]
        memo: String,
    },
    /// Ask the server to query the gateway and settle a pending order
    Sync {
        #[command(flatten)]
        server: ServerArgs,

        /// Merchant trade number
        trade_no: String,
    },
}

#[derive(Subcommand)]
enum CheckmacAction {
    /// Sign fields and print the signed form as JSON
    Sign(FieldArgs),
    /// Verify the CheckMacValue carried in the fields
    Verify(FieldArgs),
}

#[derive(Args)]
struct FieldArgs {
    /// Merchant HashKey (defaults to the public staging merchant)
    #[arg(long, default_value = "pwFHCqoQZGmho4w6")]
    key: String,

    /// Merchant HashIV (defaults to the public staging merchant)
    #[arg(long, default_value = "EkRm7iFT261dpevs")]
    iv: String,

    /// Read fields from a urlencoded form body
    #[arg(long, value_name = "FILE")]
    form: Option<PathBuf>,

    /// Gateway fields (can be specified multiple times)
    #[arg(value_name = "FIELD=VALUE")]
    fields: Vec<String>,
}

#[derive(Args)]
struct ServerArgs {
    /// Base URL of the pointdrop server
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,
}

impl ServerArgs {
    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.server.trim_end_matches('/'), path)
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Checkmac { action } => handle_checkmac(action),
        Commands::Balance { server, account } => handle_balance(&server, &account),
        Commands::Recharge {
            server,
            account,
            amount,
            memo,
        } => handle_recharge(&server, &account, amount, &memo),
        Commands::Sync { server, trade_no } => handle_sync(&server, &trade_no),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_checkmac(action: CheckmacAction) -> anyhow::Result<()> {
    use colored::Colorize;

    match action {
        CheckmacAction::Sign(args) => {
            let keys = MerchantKeys::new(&args.key, &args.iv);
            let mut fields = fields::collect_fields(args.form.as_deref(), &args.fields)?;
            sign(&mut fields, &keys);

            println!("{}", serde_json::to_string_pretty(&fields)?);
            Ok(())
        }
        CheckmacAction::Verify(args) => {
            let keys = MerchantKeys::new(&args.key, &args.iv);
            let fields = fields::collect_fields(args.form.as_deref(), &args.fields)?;

            match verify(&fields, &keys) {
                Ok(()) => {
                    println!("{} {}", "✓".green().bold(), "CheckMacValue verified".green());
                    Ok(())
                }
                Err(e) => {
                    eprintln!("{} {}", "✗".red().bold(), "CheckMacValue verification failed".red());
                    eprintln!();
                    eprintln!("  Supplied: {}", fields.get(CHECK_MAC_FIELD).unwrap_or("<none>"));
                    eprintln!("  Expected: {}", check_mac_value(&fields, &keys));
                    Err(e.into())
                }
            }
        }
    }
}

/// Sends a request and returns its JSON body, turning error statuses into errors.
fn json_response(result: Result<ureq::Response, ureq::Error>) -> anyhow::Result<Value> {
    match result {
        Ok(response) => Ok(response.into_json()?),
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            Err(anyhow::anyhow!("Server returned {}: {}", code, message))
        }
        Err(e) => Err(anyhow::anyhow!("Request failed: {}", e)),
    }
}

fn handle_balance(server: &ServerArgs, account: &str) -> anyhow::Result<()> {
    use colored::Colorize;

    let body = json_response(ureq::get(&server.url(&format!("/accounts/{}/balance", account))).call())?;

    println!("  Account: {}", account);
    println!("  Balance: {}", body["balance"].to_string().bold());
    if body["emailVerifiedAt"].is_string() {
        println!("  Email:   {}", "verified".green());
    } else {
        println!("  Email:   {}", "unverified".dimmed());
    }

    if let Some(entries) = body["recentEntries"].as_array() {
        if !entries.is_empty() {
            println!();
            println!("  Recent entries:");
            for entry in entries {
                println!(
                    "    {:>6}  {:<32}  {}",
                    entry["delta"],
                    entry["reason"].as_str().unwrap_or(""),
                    entry["createdAt"].as_str().unwrap_or("")
                );
            }
        }
    }

    Ok(())
}

fn handle_recharge(server: &ServerArgs, account: &str, amount: i64, memo: &str) -> anyhow::Result<()> {
    use colored::Colorize;

    let body = json_response(ureq::post(&server.url("/admin/recharge")).send_json(json!({
        "accountId": account,
        "amount": amount,
        "memo": memo,
    })))?;

    println!("{} Recharge applied", "✓".green().bold());
    println!();
    println!("  Account: {}", account);
    println!("  Ledger:  {}", body["ledgerId"].as_str().unwrap_or(""));
    println!("  Balance: {}", body["balance"]);
    Ok(())
}

fn handle_sync(server: &ServerArgs, trade_no: &str) -> anyhow::Result<()> {
    use colored::Colorize;

    let body = json_response(
        ureq::post(&server.url(&format!("/admin/orders/{}/sync", trade_no))).call(),
    )?;

    let status = body["order"]["status"].as_str().unwrap_or("UNKNOWN");
    let rendered = match status {
        "PAID" => status.green().bold(),
        "FAILED" => status.red().bold(),
        _ => status.yellow().bold(),
    };

    println!("  Order:        {}", trade_no);
    println!("  Status:       {}", rendered);
    println!(
        "  Gateway said: {}",
        body["tradeStatus"].as_str().unwrap_or("(not queried)")
    );
    Ok(())
}

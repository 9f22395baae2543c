//! Demo client
//!
//! Usage: `shard-client [shard1-addr] [shard2-addr]`, defaulting to the first
//! replica of each shard on localhost.

use ledger_core::AccountId;
use shard::rpc::RpcClient;

async fn run_transaction(client: &RpcClient, from: &str, to: &str) -> anyhow::Result<()> {
    println!("\n--- Connecting to shard node at {} ---", client.addr());

    println!("   -> Creating account: {} ($100)", from);
    if !client.put(AccountId::new(from), 100).await? {
        println!("      Put rejected");
    }

    println!("   -> Creating account: {} ($0)", to);
    if !client.put(AccountId::new(to), 0).await? {
        println!("      Put rejected");
    }

    println!("   -> Attempting transfer: {} sends $50 to {}", from, to);
    if client.transfer(AccountId::new(from), AccountId::new(to), 50).await? {
        println!("      Success! Transaction committed.");
    } else {
        println!("      Failed! Server rejected the transaction (wrong shard or insufficient funds).");
    }

    match client.get(AccountId::new(from)).await {
        Ok(balance) => println!("   -> {}'s new balance: ${}", from, balance),
        Err(e) => println!("   -> Balance of {} unavailable: {}", from, e),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let shard1 = RpcClient::new(args.next().unwrap_or_else(|| "127.0.0.1:8001".to_string()));
    let shard2 = RpcClient::new(args.next().unwrap_or_else(|| "127.0.0.1:9001".to_string()));

    // Intra-shard on shard 1 (A-M)
    run_transaction(&shard1, "Alice", "Bob").await?;

    // Intra-shard on shard 2 (N-Z)
    run_transaction(&shard2, "Zelda", "Xander").await?;

    // Boundary check: shard 1 must refuse accounts it does not own
    println!("\n--- Sending 'Zelda' to shard 1 (should fail) ---");
    run_transaction(&shard1, "Zelda", "Xander").await?;

    // Cross-shard: Alice (shard 1) pays Xander (shard 2)
    println!("\n--- Cross-shard: Alice sends $25 to Xander ---");
    let committed = shard1
        .transfer(AccountId::new("Alice"), AccountId::new("Xander"), 25)
        .await?;
    println!("   -> Committed: {}", committed);
    println!("   -> Alice: ${}", shard1.get(AccountId::new("Alice")).await?);
    println!("   -> Xander: ${}", shard2.get(AccountId::new("Xander")).await?);

    Ok(())
}

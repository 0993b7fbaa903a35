//! Spawn a REPL session, run a few blocks, and show that interpreter
//! state persists between them.
//!
//! ```bash
//! cargo run --example repl
//! ```

use pytether::repl::ReplOptions;
use pytether::{Interpreter, ReplSession};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pytether::init()?;

    let interpreter = Interpreter::from_system()?;
    let session = ReplSession::spawn(&interpreter, ReplOptions::default()).await?;

    println!("{}", session.execute("import sys; print(sys.version)", true).await?);

    session.execute("total = sum(range(10))", true).await?;
    println!("total = {}", session.execute("print(total)", true).await?);

    match session.execute("1 / 0", true).await {
        Ok(_) => unreachable!(),
        Err(e) => println!("as expected: {e}"),
    }

    session.close().await?;
    Ok(())
}

//! Bidirectional JSON-RPC demo: the parent calls Python methods, and one
//! of them calls back into a parent-side handler.
//!
//! ```bash
//! cargo run --example rpc_service
//! ```

use std::sync::Arc;

use pytether::rpc::{typed, HandlerTable, RpcOptions, Service};
use pytether::{Interpreter, JsonRpcSession, Module, PythonProgram};

const CHILD_SOURCE: &str = r#"
from pytether import JSONQueueServer, exposed


class Pricing(JSONQueueServer):
    @exposed
    def quote(self, amount: float, state: str) -> float:
        """Quote a price including the host-supplied tax rate."""
        rate = self.call_host("tax", [state])
        return amount * (1.0 + rate)


Pricing().serve_forever()
"#;

struct TaxTable;

impl Service for TaxTable {
    fn export(self: &Arc<Self>, table: &mut HandlerTable) {
        table.insert(
            "tax",
            typed(|(state,): (String,)| {
                Ok(match state.as_str() {
                    "CA" => 0.0725,
                    "NY" => 0.08875,
                    _ => 0.0,
                })
            }),
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pytether::init()?;

    let interpreter = Interpreter::from_system()?;
    let program = PythonProgram::new(
        "pricing",
        "/virtual_modules",
        Module::from_source("__main__", "/virtual_modules/pricing.py", CHILD_SOURCE),
    );

    let session = JsonRpcSession::spawn_with_service(
        &interpreter,
        &program,
        RpcOptions::default(),
        Arc::new(TaxTable),
    )
    .await?;

    println!("exposed methods: {:?}", session.get_methods());

    let total: f64 = session
        .on("quote")
        .arg("amount", 100.0)
        .arg("state", "CA")
        .call_as()
        .await?;
    println!("quote for CA: {total}");

    session.shutdown().await?;
    Ok(())
}

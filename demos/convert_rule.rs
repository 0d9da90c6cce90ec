//! Convert a single rule and print the resulting query.
//!
//! Run with: cargo run --example convert_rule

use anyhow::Result;
use sigma_converter::{ConversionEngine, GenericBackend, SigmaRule};

const RULE: &str = r#"
title: Suspicious Network Logon
id: 0cb1a7a1-3b34-4d3a-9b9e-f2b60a2f4f9c
status: test
level: high
logsource:
    product: windows
    service: security
detection:
    selection:
        EventID: 4624
        LogonType: 3
    filter:
        AccountName: ANONYMOUS LOGON
    condition: selection and not filter
"#;

fn main() -> Result<()> {
    let rule = SigmaRule::from_yaml_str(RULE)?;
    let engine = ConversionEngine::new(GenericBackend::new());

    println!("rule: {}", rule.title);
    for query in engine.convert_rule(&rule)? {
        println!("query: {query}");
    }
    Ok(())
}

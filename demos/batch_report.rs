//! Batch-convert a collection through a field-mapping pipeline and print the
//! JSON report, including diagnostics for the rule that fails to parse.
//!
//! Run with: cargo run --example batch_report

use anyhow::Result;
use sigma_converter::{
    ConversionEngine, ConversionOptions, GenericBackend, ProcessingPipeline, SigmaCollection,
};

const COLLECTION: &str = r#"
title: Failed logon
id: failed-logon
level: medium
detection:
    selection:
        EventID: 4625
    condition: selection
---
title: Broken rule
id: broken
detection:
    selection:
        EventID: 1
    condition: selection and
---
title: Brute force burst
correlation:
    type: event_count
    rules: [failed-logon]
    group-by: [TargetUserName]
    timespan: 10m
    condition:
        gte: 100
"#;

const PIPELINE: &str = r#"
name: ecs
priority: 20
transformations:
    - type: field_name_mapping
      mapping:
          EventID: event.code
"#;

fn main() -> Result<()> {
    let collection = SigmaCollection::from_yaml_str(COLLECTION)?;
    let engine = ConversionEngine::new(GenericBackend::new());
    let options = ConversionOptions {
        pipeline: Some(ProcessingPipeline::from_yaml_str(PIPELINE)?),
        ..ConversionOptions::default()
    };

    let report = collection.convert(&engine, &options);
    println!("{}", report.to_json()?);
    Ok(())
}

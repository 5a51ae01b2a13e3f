use anyhow::{bail, Context};
use chrono::NaiveDate;
use dotenv::dotenv;
use royalty_report_reconciler::llm::GeminiClassifier;
use royalty_report_reconciler::*;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;

// Usage: preview_report <report.xlsx|csv> <period start> <period end> [flat rate]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        bail!("usage: preview_report <report> <YYYY-MM-DD> <YYYY-MM-DD> [rate]");
    }
    let path = &args[1];
    let start = NaiveDate::parse_from_str(&args[2], "%Y-%m-%d").context("period start")?;
    let end = NaiveDate::parse_from_str(&args[3], "%Y-%m-%d").context("period end")?;
    let rate = match args.get(4) {
        Some(r) => Decimal::from_str(r).context("rate")?,
        None => Decimal::new(8, 2),
    };

    let contracts = Arc::new(InMemoryContractStore::new());
    contracts
        .insert(Contract {
            id: "DEMO".to_string(),
            licensee_name: "Demo Licensee".to_string(),
            rate_structure: RateStructure::Flat { rate },
            start_date: None,
            end_date: None,
            reporting_frequency: Some(ReportingFrequency::Quarterly),
            minimum_guarantee: None,
        })
        .await;

    let pipeline = RoyaltyPipeline::in_memory(
        PipelineConfig::default(),
        contracts,
        Arc::new(GeminiClassifier::from_env()?),
    );

    println!("📄 Reading {}...", path);
    let bytes = tokio::fs::read(path).await?;
    let preview = pipeline
        .preview_upload("DEMO", &bytes, path, start, end)
        .await?;

    println!(
        "Header at row {}; {} data rows, {} summary rows skipped",
        preview.header_row_index + 1,
        preview.data_rows,
        preview.summary_rows.len()
    );
    println!("\nColumn mapping:");
    for (column, field) in preview.classification.mapping.iter() {
        let source = preview
            .classification
            .provenance
            .get(column)
            .map(|p| format!("{:?}", p))
            .unwrap_or_default();
        println!("  {:<30} -> {:<26} ({})", column, field.as_tag(), source);
    }

    match &preview.draft {
        Some(draft) => {
            println!("\nNet sales:          {}", draft.sales.net_sales);
            println!("Calculated royalty: {}", draft.royalty.calculated_royalty);
            if let Some(reported) = draft.sales.licensee_reported_royalty {
                println!("Reported royalty:   {}", reported);
            }
            if draft.discrepancy.has_discrepancy {
                println!(
                    "⚠️  Discrepancy of {}",
                    draft.discrepancy.discrepancy_amount.unwrap_or_default()
                );
            }
        }
        None => println!("\nNo draft calculation; review the mapping first."),
    }

    for warning in &preview.warnings {
        println!("⚠️  {}", warning);
    }

    let period = pipeline
        .confirm_upload(ConfirmRequest {
            contract_id: "DEMO".to_string(),
            upload_id: preview.upload_id,
            column_mapping: preview.classification.mapping.clone(),
            category_mapping: None,
            period_start: start,
            period_end: end,
            save_mapping: true,
            override_duplicate: false,
        })
        .await?;
    println!("\n✅ Stored sales period {}", period.id);

    Ok(())
}

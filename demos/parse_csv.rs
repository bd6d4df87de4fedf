use financial_analysis_forge::{ParseJobCoordinator, RawGrid};
use futures::StreamExt;

const SAMPLE: &str = r#"Income Statement,,,
,FY2024,FY2023,FY2022
Net Sales,"4,820","4,310","3,950"
Cost of Sales,"(2,410)","(2,200)","(2,050)"
Gross Profit,"2,410","2,110","1,900"
SG&A,"(1,290)","(1,180)","(1,100)"
Operating Income,"1,120",930,800
Interest Expense,(60),(55),(50)
Income Before Taxes,"1,060",875,750
Provision for Income Taxes,(265),(219),(188)
Net Income,795,656,562
"#;

fn read_grid(data: &str) -> anyhow::Result<RawGrid> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data.as_bytes());

    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record?.iter().map(str::to_string).collect::<Vec<_>>());
    }
    Ok(RawGrid::from_records(records))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path)?,
        None => SAMPLE.to_string(),
    };
    let grid = read_grid(&data)?;

    let coordinator = ParseJobCoordinator::default();
    let started = coordinator.start_parse("demo", grid);
    if !started.ok {
        anyhow::bail!("could not start parse: {:?}", started.error);
    }

    if let Some(subscription) = coordinator.subscribe("demo") {
        let mut lines = Box::pin(subscription.into_lines());
        while let Some(line) = lines.next().await {
            println!("{}", line);
        }
    }

    let outcome = match coordinator.result("demo") {
        Ok(outcome) => outcome,
        Err(reason) => anyhow::bail!("parse did not complete: {}", reason),
    };

    println!("\n{}", outcome.details_table().to_markdown());

    if let Some(period) = outcome.most_recent_period() {
        if let Some(table) = outcome.statement_table(period) {
            println!("Statement for {}\n\n{}", period, table.to_markdown());
        }

        println!("Metrics for {}", period);
        for (name, display) in outcome.metric_displays(period) {
            println!("  {:<22} {}", name, display.unwrap_or_else(|| "—".to_string()));
        }
    }

    for anomaly in &outcome.anomalies {
        println!("! {}", anomaly);
    }

    Ok(())
}

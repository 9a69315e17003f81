//! FlowDoc demo client.
//!
//! Documents a sample workflow, hands it to a Slack integration, reopens it
//! for editing while offline, and lets the sync queue catch up once the
//! network comes back. Storage and endpoints come from `FLOWDOC_*`
//! variables; `RUST_LOG` controls output.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use flowdoc_app::{AppConfig, AppContext, AppError, FallbackGenerator, LocalAnalysis, Services};
use flowdoc_core::{default_questions, CommentDraft};

const SAMPLE_ANSWERS: [&str; 16] = [
    "Supplier invoice approval",
    "Receive invoice, match to PO, get approval, enter in ledger, schedule payment",
    "Email, Excel, QuickBooks",
    "Matching invoices to purchase orders and keying totals into the ledger",
    "AP clerk enters data, department head approves, controller pays",
    "PDF invoices arrive in a shared mailbox",
    "Whether the amount matches the PO and who must approve it",
    "Waiting for department heads to approve",
    "Missing PO numbers and approvals stuck in inboxes",
    "The clerk emails the supplier and parks the invoice",
    "A scheduled payment and an updated ledger",
    "Month-end reconciliation against bank statements",
    "Data extraction from PDFs and approval reminders",
    "Daily",
    "About 20 minutes per invoice",
    "$4,500 a month",
];

#[tokio::main]
async fn main() -> Result<(), AppError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;
    let settle = config.reachability.settle;
    let generator = Arc::new(FallbackGenerator::new(Arc::new(LocalAnalysis::new())));
    let services = Services::from_config(&config, generator)?;
    let ctx = AppContext::start(config, services).await;
    let store = ctx.store();

    for (question, answer) in default_questions().iter().zip(SAMPLE_ANSWERS) {
        store.update_answer(&question.id, answer).await;
    }
    store.set_workflow_name("Invoice approval").await;
    store.set_business_name("Acme Corp").await;
    store.set_department_name("Finance").await;

    let Some(id) = store.submit_workflow().await else {
        warn!("submit failed: {:?}", store.snapshot().last_submit_error);
        ctx.shutdown().await;
        return Ok(());
    };
    if let Some(saved) = store.submission(id) {
        info!(
            "saved '{}' v{} with {} steps, yearly savings {:.2}",
            saved.name,
            saved.version,
            saved.steps.len(),
            saved.cost_analysis.map(|c| c.yearly_savings).unwrap_or_default()
        );
    }

    let slack = BTreeMap::from([("channel".to_string(), "#finance-ops".to_string())]);
    if let Ok(integration) = store.add_integration("slack", slack).await {
        match store.execute_integration(integration.id, "post_summary").await {
            Ok(run) => info!("{}", run.message),
            Err(e) => warn!("integration run failed: {e}"),
        }
    }

    info!("going offline");
    ctx.reachability().set_online(false);
    store.edit_submission(id).await;
    store.update_answer("q14", "Twice a day").await;
    store.add_comment(CommentDraft::new("Approvals are the bottleneck")).await;
    store.submit_workflow().await;
    info!("{} change(s) waiting for the network", ctx.queue().len());

    info!("back online");
    ctx.reachability().set_online(true);
    tokio::time::sleep(settle + Duration::from_secs(2)).await;
    info!("{} change(s) still pending", ctx.queue().len());

    for n in store.notifications().iter().rev() {
        info!("[{:?}] {}: {}", n.kind, n.title, n.message);
    }

    ctx.shutdown().await;
    Ok(())
}

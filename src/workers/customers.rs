//! Reconciliation sweep: callers without a customer linkage in either
//! call-logs or voicemails are looked up at the customer service and
//! back-filled.

use std::time::Duration;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::state::AppState;
use crate::stores::{call_logs, mailboxes as mailbox_store};

const PASS_INTERVAL: Duration = Duration::from_secs(10 * 60);
const PASS_BUDGET: Duration = Duration::from_secs(5 * 60);

pub async fn run(state: AppState, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PASS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        if tokio::time::timeout(PASS_BUDGET, pass(&state)).await.is_err() {
            error!("reconciliation pass exceeded its time budget");
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
    }
}

async fn pass(state: &AppState) {
    let numbers = {
        let state = state.clone();
        let loaded = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            let mut conn = state.db().map_err(|err| anyhow!("{err}"))?;

            let mut numbers = call_logs::distinct_numbers_without_customer(&mut conn)?;

            match mailbox_store::distinct_numbers_without_customer(&mut conn) {
                Ok(more) => numbers.extend(more),
                Err(err) => {
                    error!(error = %err, "failed to find distinct, unidentified numbers in voicemails");
                }
            }

            Ok(numbers)
        })
        .await;

        match loaded {
            Ok(Ok(numbers)) => numbers,
            Ok(Err(err)) => {
                error!(error = %err, "failed to find distinct, unidentified numbers");
                return;
            }
            Err(join_err) => {
                error!(error = %join_err, "reconciliation task panicked");
                return;
            }
        }
    };

    let mut numbers = numbers;
    numbers.sort();
    numbers.dedup();
    numbers.retain(|number| !number.is_empty() && number != crate::phone::ANONYMOUS);

    info!(
        count = numbers.len(),
        "found distinct numbers that are not associated with a customer record"
    );

    if numbers.is_empty() {
        return;
    }

    let customers = match state.customer.search_by_phone(&numbers).await {
        Ok(customers) => customers,
        Err(err) => {
            error!(error = %err, "failed to search for customers");
            return;
        }
    };

    info!(count = customers.len(), "found customers for unmatched numbers");

    for customer in customers {
        for number in &customer.phone_numbers {
            let state = state.clone();
            let number = number.clone();
            let customer_id = customer.id.clone();
            let number_for_task = number.clone();

            let result = tokio::task::spawn_blocking(move || -> anyhow::Result<(usize, usize)> {
                let mut conn = state.db().map_err(|err| anyhow!("{err}"))?;

                let logs =
                    call_logs::update_unmatched_number(&mut conn, &number_for_task, &customer_id)?;
                let mails = mailbox_store::update_unmatched_number(
                    &mut conn,
                    &number_for_task,
                    &customer_id,
                )?;

                Ok((logs, mails))
            })
            .await;

            match result {
                Ok(Ok((logs, mails))) => {
                    if logs > 0 || mails > 0 {
                        info!(
                            customer_id = %customer.id,
                            phone_number = %number,
                            call_logs = logs,
                            voicemails = mails,
                            "unmatched customer entries updated successfully"
                        );
                    }
                }
                Ok(Err(err)) => {
                    error!(
                        customer_id = %customer.id,
                        phone_number = %number,
                        error = %err,
                        "failed to update unmatched customers"
                    );
                }
                Err(join_err) => {
                    error!(error = %join_err, "back-fill task panicked");
                }
            }
        }
    }
}

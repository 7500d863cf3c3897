use std::future::Future;
use std::pin::Pin;

use crate::plan::PlanSnapshot;

pub type PresenterFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Presentation layer the host drives for plan views.
pub trait Presenter: Send + Sync + 'static {
    fn anchor_plan_view(&self, plan: PlanSnapshot) -> PresenterFuture<'_>;

    fn reveal_plan_step(&self, plan: PlanSnapshot, index: u32) -> PresenterFuture<'_>;
}

/// Presenter that only logs. Used when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPresenter;

impl Presenter for LoggingPresenter {
    fn anchor_plan_view(&self, plan: PlanSnapshot) -> PresenterFuture<'_> {
        Box::pin(async move {
            tracing::info!(
                session_id = %plan.session_id,
                exchange_id = %plan.exchange_id,
                steps = plan.steps.len(),
                state = %plan.state,
                "plan view anchored"
            );
        })
    }

    fn reveal_plan_step(&self, plan: PlanSnapshot, index: u32) -> PresenterFuture<'_> {
        Box::pin(async move {
            let title = plan
                .steps
                .iter()
                .find(|step| step.index == index)
                .map(|step| step.title.as_str())
                .unwrap_or("");
            tracing::info!(
                session_id = %plan.session_id,
                exchange_id = %plan.exchange_id,
                index,
                title,
                "plan step revealed"
            );
        })
    }
}

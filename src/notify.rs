//! Link rendering and best-effort mail dispatch.
//!
//! Links are rendered once, when an authorizer is enrolled, and stashed on the
//! sanction. Everything sent later (first notice, resends) reads the stashed
//! copy, so changing a template never invalidates links already out.
use std::sync::Arc;

use tracing::{debug, warn};

use crate::collaborators::{NotificationContext, NotificationGateway, TemplateId};
use crate::error::{SanctionError, SanctionResult};
use crate::sanction::{Sanction, StashedUrls};
use crate::variant::{Notice, SanctionVariant};

pub fn render(template: &str, base_url: &str, artifact_id: &str, token: &str) -> String {
    template
        .replace("{base_url}", base_url.trim_end_matches('/'))
        .replace("{artifact_id}", artifact_id)
        .replace("{token}", token)
}

pub fn view_url(base_url: &str, artifact_id: &str) -> String {
    format!("{}/{}/", base_url.trim_end_matches('/'), artifact_id)
}

/// Render the view/approve/reject links for an enrolled authorizer
pub fn build_urls(
    sanction: &Sanction,
    authorizer: &str,
    base_url: &str,
) -> SanctionResult<StashedUrls> {
    let entry = sanction
        .ledger()
        .get(authorizer)
        .ok_or_else(|| SanctionError::Permissions {
            sanction_id: sanction.id().to_string(),
            authorizer: authorizer.to_string(),
        })?;
    let templates = sanction.variant().url_templates();

    Ok(StashedUrls {
        view: view_url(base_url, &entry.artifact_ref),
        approve: render(templates.approve, base_url, &entry.artifact_ref, &entry.approval_token),
        reject: render(templates.reject, base_url, &entry.artifact_ref, &entry.rejection_token),
    })
}

pub fn pending_context(sanction: &Sanction) -> NotificationContext {
    let core = sanction.core();
    let mut ctx = NotificationContext::new();
    ctx.insert("sanction_id".into(), core.id().to_string());
    ctx.insert("kind".into(), sanction.kind().as_str().into());
    ctx.insert("artifact_id".into(), core.artifact_id().to_string());
    ctx.insert(
        "initiation_date".into(),
        core.initiation_date().to_datetime_utc().to_rfc3339(),
    );
    if let Some(initiator) = core.initiated_by() {
        ctx.insert("initiated_by".into(), initiator.to_string());
    }
    if let Some(end) = core.end_date() {
        ctx.insert("end_date".into(), end.to_datetime_utc().to_rfc3339());
    }
    sanction.variant().extend_context(&mut ctx);
    ctx
}

#[derive(Clone)]
pub struct Notifier {
    gateway: Arc<dyn NotificationGateway>,
    base_url: String,
}

impl Notifier {
    pub fn new(gateway: Arc<dyn NotificationGateway>, base_url: impl Into<String>) -> Self {
        Self {
            gateway,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Never fails the caller: a delivery error is logged and reported as `false`
    pub fn send(&self, to: &str, template: TemplateId, context: &NotificationContext) -> bool {
        match self.gateway.send(to, template, context) {
            Ok(()) => {
                debug!(to, ?template, "notification sent");
                true
            }
            Err(e) => {
                warn!(to, ?template, error = %e, "notification delivery failed");
                false
            }
        }
    }

    pub fn deliver(&self, notices: &[Notice]) {
        for notice in notices {
            self.send(&notice.to, notice.template, &notice.context);
        }
    }

    /// Authorizers get their stashed links; everyone else gets the view link.
    /// Returns how many sends went through.
    pub fn notify_pending(&self, sanction: &Sanction, recipients: &[String]) -> usize {
        let kind = sanction.kind();
        let mut sent = 0;

        for recipient in recipients {
            let mut ctx = pending_context(sanction);
            let template = if sanction.ledger().contains(recipient) {
                let Some(urls) = sanction.core().stashed_urls(recipient) else {
                    warn!(
                        sanction_id = %sanction.id(),
                        recipient = %recipient,
                        "authorizer has no stashed links; skipping"
                    );
                    continue;
                };
                ctx.insert("view_url".into(), urls.view.clone());
                ctx.insert("approval_url".into(), urls.approve.clone());
                ctx.insert("rejection_url".into(), urls.reject.clone());
                TemplateId::AuthorizerPending(kind)
            } else {
                ctx.insert(
                    "view_url".into(),
                    view_url(&self.base_url, sanction.core().artifact_id()),
                );
                TemplateId::NonAuthorizerPending(kind)
            };

            if self.send(recipient, template, &ctx) {
                sent += 1;
            }
        }
        sent
    }
}

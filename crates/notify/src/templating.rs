//! Minijinja rendering of escalation messages.
//!
//! Templates are arbitrary strings, so a fresh [`minijinja::Environment`]
//! is built per render.

use serde::Serialize;
use uuid::Uuid;

use oncall_core::{EscalationStep, Incident};

use crate::traits::NotifyError;

pub const DEFAULT_TEMPLATE: &str = "[{{ incident.title }}] escalation step {{ step.number }}";

/// Context data available to message templates.
#[derive(Debug, Clone, Serialize)]
pub struct MessageContext {
    pub incident: IncidentContext,
    pub step: StepContext,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentContext {
    pub id: Uuid,
    pub title: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepContext {
    /// Zero-based position in the policy.
    pub index: usize,
    /// One-based position, as shown to people.
    pub number: usize,
    pub target_type: String,
    pub delay_minutes: u32,
}

impl MessageContext {
    pub fn new(incident: &Incident, step: &EscalationStep, index: usize) -> Self {
        Self {
            incident: IncidentContext {
                id: incident.id,
                title: incident.title.clone(),
                status: incident.status.to_string(),
            },
            step: StepContext {
                index,
                number: index + 1,
                target_type: step.target_type.to_string(),
                delay_minutes: step.delay_minutes,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageRenderer {
    template: String,
}

impl MessageRenderer {
    /// Renderer using `template`, checked for syntax errors up front.
    pub fn new(template: impl Into<String>) -> Result<Self, NotifyError> {
        let template = template.into();
        Self::build_env()
            .template_from_str(&template)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        Ok(Self { template })
    }

    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();
        env.add_filter("upper", upper_filter);
        env
    }

    pub fn render(&self, ctx: &MessageContext) -> Result<String, NotifyError> {
        Self::build_env()
            .render_str(&self.template, ctx)
            .map_err(|e| NotifyError::Template(e.to_string()))
    }

    /// Render, falling back to the plain default text when the template
    /// fails at render time. Escalation must not stall on a bad template.
    pub fn render_or_default(&self, ctx: &MessageContext) -> String {
        match self.render(ctx) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(incident_id = %ctx.incident.id, error = %e, "message template failed, using default text");
                format!("[{}] escalation step {}", ctx.incident.title, ctx.step.number)
            }
        }
    }
}

impl Default for MessageRenderer {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

fn upper_filter(value: String) -> String {
    value.to_uppercase()
}

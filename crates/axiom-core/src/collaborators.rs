use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured inputs for proposal content generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectBrief {
    pub project_title: String,
    pub client_name: String,
    pub client_company: Option<String>,
    pub description: Option<String>,
    pub budget: Decimal,
    pub currency: String,
    pub timeline: Option<String>,
}

/// The five text blocks every proposal carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedContent {
    pub executive_summary: String,
    pub scope_of_work: String,
    pub pricing_breakdown: String,
    pub timeline_details: String,
    pub terms_and_conditions: String,
}

/// External content generator (an LLM in production). Implementations may
/// fail or time out; callers fall back to [`TemplateGenerator`].
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, brief: &ProjectBrief) -> anyhow::Result<GeneratedContent>;
}

/// Deterministic template fallback. Produces the same block structure as
/// the AI collaborator from the same inputs, so a generator outage never
/// blocks proposal creation.
#[derive(Debug, Clone, Default)]
pub struct TemplateGenerator;

impl TemplateGenerator {
    pub fn render(brief: &ProjectBrief) -> GeneratedContent {
        let client = match brief.client_company.as_deref() {
            Some(company) if !company.is_empty() => {
                format!("{} ({})", brief.client_name, company)
            }
            _ => brief.client_name.clone(),
        };
        let timeline = brief.timeline.as_deref().unwrap_or("to be agreed");
        let description = brief
            .description
            .as_deref()
            .unwrap_or("the project described below");

        GeneratedContent {
            executive_summary: format!(
                "This proposal outlines {} for {}. The engagement covers {} with a \
                 total budget of {} {} and an estimated timeline of {}.",
                brief.project_title, client, description, brief.budget, brief.currency, timeline
            ),
            scope_of_work: format!(
                "The scope of {} includes discovery, implementation, review cycles \
                 and final delivery as agreed with {}. Work outside this scope is \
                 quoted separately.",
                brief.project_title, client
            ),
            pricing_breakdown: format!(
                "Total project fee: {} {}. The fee covers all work described in the \
                 scope. Invoices are issued against this proposal and payable on the \
                 stated terms.",
                brief.budget, brief.currency
            ),
            timeline_details: format!(
                "Estimated timeline: {}. Milestones and delivery dates are confirmed \
                 at kickoff and revised only by mutual written agreement.",
                timeline
            ),
            terms_and_conditions: format!(
                "This agreement between the freelancer and {} takes effect when both \
                 parties have signed. Payment is due per the attached invoice. Either \
                 party may terminate with written notice; work completed to date is \
                 billable.",
                client
            ),
        }
    }
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate(&self, brief: &ProjectBrief) -> anyhow::Result<GeneratedContent> {
        Ok(Self::render(brief))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound notification channel. Fire-and-forget from the engines'
/// perspective; a failed send never rolls back domain state.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub customer_name: String,
    pub customer_email: String,
    pub proposal_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub checkout_url: String,
    pub session_id: String,
}

/// Payment-processor checkout collaborator. Invoice generation tolerates
/// failure here and leaves the payment link unset for later manual entry.
#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> anyhow::Result<CheckoutSession>;
}

/// Provider backed by a hosted payment page: sessions are plain URLs under
/// a configured base, no processor credentials involved. Deployments that
/// integrate a real processor swap in their own [`CheckoutProvider`].
#[derive(Debug, Clone)]
pub struct HostedCheckoutProvider {
    base_url: String,
}

impl HostedCheckoutProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn session(&self, request: &CheckoutRequest) -> CheckoutSession {
        CheckoutSession {
            checkout_url: format!("{}/pay/{}", self.base_url, request.invoice_number),
            session_id: format!("cks_{}", request.invoice_id.simple()),
        }
    }
}

#[async_trait]
impl CheckoutProvider for HostedCheckoutProvider {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> anyhow::Result<CheckoutSession> {
        Ok(self.session(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn brief() -> ProjectBrief {
        ProjectBrief {
            project_title: "Website Redesign".to_string(),
            client_name: "Jane Doe".to_string(),
            client_company: Some("Acme Co".to_string()),
            description: Some("a full redesign of the marketing site".to_string()),
            budget: Decimal::new(500_000, 2),
            currency: "USD".to_string(),
            timeline: Some("6 weeks".to_string()),
        }
    }

    #[test]
    fn template_generator_is_deterministic() {
        let first = TemplateGenerator::render(&brief());
        let second = TemplateGenerator::render(&brief());
        assert_eq!(first, second);
    }

    #[test]
    fn template_generator_fills_all_blocks() {
        let content = TemplateGenerator::render(&brief());
        assert!(content.executive_summary.contains("Website Redesign"));
        assert!(content.executive_summary.contains("Acme Co"));
        assert!(content.pricing_breakdown.contains("5000"));
        assert!(content.timeline_details.contains("6 weeks"));
        assert!(!content.scope_of_work.is_empty());
        assert!(!content.terms_and_conditions.is_empty());
    }

    #[test]
    fn template_generator_handles_missing_optionals() {
        let mut sparse = brief();
        sparse.client_company = None;
        sparse.description = None;
        sparse.timeline = None;
        let content = TemplateGenerator::render(&sparse);
        assert!(content.executive_summary.contains("Jane Doe"));
        assert!(content.timeline_details.contains("to be agreed"));
    }

    fn checkout_request() -> CheckoutRequest {
        CheckoutRequest {
            invoice_id: Uuid::new_v4(),
            invoice_number: "INV-20260301093000-1234".to_string(),
            amount: Decimal::new(500_000, 2),
            currency: "USD".to_string(),
            customer_name: "Jane Doe".to_string(),
            customer_email: "jane@example.com".to_string(),
            proposal_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn hosted_checkout_builds_links_under_the_base_url() {
        let provider = HostedCheckoutProvider::new("https://pay.example.com");
        let session = provider.session(&checkout_request());
        assert_eq!(
            session.checkout_url,
            "https://pay.example.com/pay/INV-20260301093000-1234"
        );
        assert!(session.session_id.starts_with("cks_"));
    }

    #[test]
    fn hosted_checkout_trims_trailing_slashes() {
        let provider = HostedCheckoutProvider::new("https://pay.example.com/");
        let session = provider.session(&checkout_request());
        assert!(!session.checkout_url.contains(".com//"));
    }
}

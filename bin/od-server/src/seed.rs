//! Development seeding

use anyhow::Result;
use od_common::{
    BusinessHoursConfig, Campaign, CampaignStatus, ContactDetails, ProviderBinding, Recipient, VoiceAgent,
};
use od_engine::CampaignStore;

/// Insert an agent bound to both providers and a ready campaign with
/// `recipients` pending recipients. Business hours are disabled so the
/// campaign can be started at any time.
pub async fn seed_demo_campaign(store: &dyn CampaignStore, recipients: usize) -> Result<Campaign> {
    let agent = VoiceAgent {
        id: uuid::Uuid::new_v4().to_string(),
        workspace_id: "dev-workspace".to_string(),
        name: "Demo Agent".to_string(),
        caller_id: Some("+15550000000".to_string()),
        bindings: vec![
            ProviderBinding::Primary {
                external_agent_id: "dev-primary-agent".to_string(),
                api_key: "dev-primary-key".to_string(),
            },
            ProviderBinding::Secondary {
                external_agent_id: "dev-secondary-agent".to_string(),
                api_key: "dev-secondary-key".to_string(),
                phone_number_id: "dev-phone-number".to_string(),
            },
        ],
    };
    store.insert_agent(&agent).await?;

    let mut campaign = Campaign::new(agent.workspace_id.clone(), agent.id.clone(), "Demo Campaign");
    campaign.status = CampaignStatus::Ready;
    campaign.business_hours = BusinessHoursConfig::disabled();
    campaign.total_recipients = recipients as u64;
    campaign.pending_recipients = recipients as u64;
    store.insert_campaign(&campaign).await?;

    let batch: Vec<_> = (0..recipients)
        .map(|i| {
            let mut recipient = Recipient::new(campaign.id.clone(), format!("+1555010{i:04}"));
            recipient.contact = ContactDetails {
                first_name: Some(format!("Demo{i}")),
                last_name: Some("Contact".to_string()),
                reason_for_call: Some("Development test call".to_string()),
                ..Default::default()
            };
            recipient.created_at += chrono::Duration::milliseconds(i as i64);
            recipient
        })
        .collect();
    store.insert_recipients(&batch).await?;

    Ok(campaign)
}

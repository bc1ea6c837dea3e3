//! Tenant limits enforced when a campaign is activated

use courier_common::types::CampaignType;
use courier_common::UserCampaignLimits;
use courier_storage::Campaign;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimitViolation {
    #[error("Active campaign limit reached ({max})")]
    TooManyActive { max: u32 },

    #[error("Scheduled campaigns are not allowed for this account")]
    ScheduledNotAllowed,

    #[error("Universal messenger targets are not allowed for this account")]
    UniversalNotAllowed,
}

/// Check a campaign against its owner's limits before activation.
///
/// `active_count` is the owner's number of campaigns already in an active
/// state, excluding this one.
pub fn check_activation(
    limits: Option<&UserCampaignLimits>,
    campaign: &Campaign,
    active_count: i64,
) -> Result<(), LimitViolation> {
    let Some(limits) = limits else {
        return Ok(());
    };

    if let Some(max) = limits.max_active_campaigns {
        if active_count >= i64::from(max) {
            return Err(LimitViolation::TooManyActive { max });
        }
    }
    if campaign.campaign_type == CampaignType::Scheduled && !limits.allow_scheduled {
        return Err(LimitViolation::ScheduledNotAllowed);
    }
    if campaign.target.is_universal() && !limits.allow_universal_target {
        return Err(LimitViolation::UniversalNotAllowed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_common::types::{MessengerTarget, UniversalOrder};
    use courier_storage::NewCampaign;
    use uuid::Uuid;

    fn campaign(owner: Uuid) -> Campaign {
        NewCampaign {
            owner_id: owner,
            name: "spring".to_string(),
            template_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            campaign_type: CampaignType::OneTime,
            target: MessengerTarget::WhatsappOnly,
            profile_ids: vec![Uuid::new_v4()],
            schedule: Default::default(),
            filter: Default::default(),
            options: Default::default(),
            scheduled_at: None,
        }
        .into_campaign(Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn test_no_limits() {
        let owner = Uuid::new_v4();
        assert_eq!(check_activation(None, &campaign(owner), 1_000), Ok(()));
    }

    #[test]
    fn test_active_limit() {
        let owner = Uuid::new_v4();
        let limits = UserCampaignLimits {
            max_active_campaigns: Some(2),
            ..UserCampaignLimits::unrestricted(owner)
        };
        assert_eq!(check_activation(Some(&limits), &campaign(owner), 1), Ok(()));
        assert_eq!(
            check_activation(Some(&limits), &campaign(owner), 2),
            Err(LimitViolation::TooManyActive { max: 2 })
        );
    }

    #[test]
    fn test_feature_flags() {
        let owner = Uuid::new_v4();
        let limits = UserCampaignLimits {
            allow_scheduled: false,
            allow_universal_target: false,
            ..UserCampaignLimits::unrestricted(owner)
        };

        let mut scheduled = campaign(owner);
        scheduled.campaign_type = CampaignType::Scheduled;
        assert_eq!(
            check_activation(Some(&limits), &scheduled, 0),
            Err(LimitViolation::ScheduledNotAllowed)
        );

        let mut universal = campaign(owner);
        universal.target = MessengerTarget::Universal {
            order: UniversalOrder::Both,
        };
        assert_eq!(
            check_activation(Some(&limits), &universal, 0),
            Err(LimitViolation::UniversalNotAllowed)
        );
    }
}

//! Fixed message catalog: one ordered list of templates per status tier.
//!
//! A sequence picks its list once, from the status at enrollment. Later score
//! changes never retarget an in-flight sequence.

use leadflow_core::types::LeadStatus;

/// One step of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub template_id: &'static str,
    /// Offset from enrollment time.
    pub delay_minutes: i64,
}

/// Subject and HTML body with `{{placeholder}}` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTemplate {
    pub id: &'static str,
    pub subject: &'static str,
    pub body: &'static str,
}

const HOUR: i64 = 60;
const DAY: i64 = 24 * HOUR;

const HOT: &[CatalogEntry] = &[
    CatalogEntry { template_id: "hot_blueprint_ready", delay_minutes: 0 },
    CatalogEntry { template_id: "hot_book_call", delay_minutes: DAY },
    CatalogEntry { template_id: "hot_case_study", delay_minutes: 3 * DAY },
];

const WARMING: &[CatalogEntry] = &[
    CatalogEntry { template_id: "warming_blueprint_ready", delay_minutes: 0 },
    CatalogEntry { template_id: "warming_insights", delay_minutes: 2 * DAY },
    CatalogEntry { template_id: "warming_case_study", delay_minutes: 5 * DAY },
    CatalogEntry { template_id: "warming_check_in", delay_minutes: 10 * DAY },
];

const COLD: &[CatalogEntry] = &[
    CatalogEntry { template_id: "cold_blueprint_ready", delay_minutes: 0 },
    CatalogEntry { template_id: "cold_resources", delay_minutes: 3 * DAY },
    CatalogEntry { template_id: "cold_nurture", delay_minutes: 7 * DAY },
    CatalogEntry { template_id: "cold_last_note", delay_minutes: 14 * DAY },
];

const FOOTER: &str = r#"<p style="font-size:12px;color:#888">You received this because you requested a blueprint. <a href="{{unsubscribe_url}}">Unsubscribe</a></p>"#;

const TEMPLATES: &[MessageTemplate] = &[
    MessageTemplate {
        id: "hot_blueprint_ready",
        subject: "{{first_name}}, your blueprint is ready",
        body: "<p>Hi {{first_name}},</p><p>Your blueprint for {{company}} is ready: {{blueprint_title}}.</p><p>{{blueprint_summary}}</p><p><a href=\"{{blueprint_url}}\">Open your blueprint</a></p>",
    },
    MessageTemplate {
        id: "hot_book_call",
        subject: "Shall we walk through it together?",
        body: "<p>Hi {{first_name}},</p><p>Teams that move fast on a plan like this usually start with a 30-minute working session. <a href=\"{{booking_url}}\">Pick a time</a> and we will map the first milestone for {{company}}.</p>",
    },
    MessageTemplate {
        id: "hot_case_study",
        subject: "How a team like {{company}} shipped this in weeks",
        body: "<p>Hi {{first_name}},</p><p>A short case study close to your problem: {{case_study}}</p><p><a href=\"{{booking_url}}\">Talk to us</a></p>",
    },
    MessageTemplate {
        id: "warming_blueprint_ready",
        subject: "Your blueprint: {{blueprint_title}}",
        body: "<p>Hi {{first_name}},</p><p>Here is the blueprint we put together: {{blueprint_summary}}</p><p><a href=\"{{blueprint_url}}\">Read it</a></p>",
    },
    MessageTemplate {
        id: "warming_insights",
        subject: "Three things most teams miss",
        body: "<p>Hi {{first_name}},</p><p>Looking at your blueprint again, these are the points where projects like yours usually stall: {{insights}}</p>",
    },
    MessageTemplate {
        id: "warming_case_study",
        subject: "A project close to yours",
        body: "<p>Hi {{first_name}},</p><p>{{case_study}}</p><p>Happy to share more if useful.</p>",
    },
    MessageTemplate {
        id: "warming_check_in",
        subject: "Any questions on the blueprint?",
        body: "<p>Hi {{first_name}},</p><p>Just checking in. If anything in the plan is unclear, reply to this email or <a href=\"{{booking_url}}\">book a call</a>.</p>",
    },
    MessageTemplate {
        id: "cold_blueprint_ready",
        subject: "Your blueprint is ready",
        body: "<p>Hi {{first_name}},</p><p>Thanks for describing your problem. Your blueprint is here: <a href=\"{{blueprint_url}}\">{{blueprint_title}}</a></p>",
    },
    MessageTemplate {
        id: "cold_resources",
        subject: "Resources to go with your blueprint",
        body: "<p>Hi {{first_name}},</p><p>A few resources that pair well with your plan: {{resources}}</p>",
    },
    MessageTemplate {
        id: "cold_nurture",
        subject: "Turning the blueprint into a first step",
        body: "<p>Hi {{first_name}},</p><p>The smallest useful first step from your blueprint is usually the hardest to pick. Here is how we would start: {{first_step}}</p>",
    },
    MessageTemplate {
        id: "cold_last_note",
        subject: "Last note from us",
        body: "<p>Hi {{first_name}},</p><p>This is our last scheduled note. Your blueprint stays available at <a href=\"{{blueprint_url}}\">this link</a>.</p>",
    },
];

/// Ordered catalog for a status tier.
pub fn entries_for(status: LeadStatus) -> &'static [CatalogEntry] {
    match status {
        LeadStatus::Hot => HOT,
        LeadStatus::Warming => WARMING,
        LeadStatus::Cold => COLD,
    }
}

/// Look up a template by id.
pub fn template(id: &str) -> Option<&'static MessageTemplate> {
    TEMPLATES.iter().find(|t| t.id == id)
}

/// Footer appended to every body.
pub fn footer() -> &'static str {
    FOOTER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_entry_has_a_template() {
        for status in [LeadStatus::Cold, LeadStatus::Warming, LeadStatus::Hot] {
            for entry in entries_for(status) {
                assert!(
                    template(entry.template_id).is_some(),
                    "missing template {}",
                    entry.template_id
                );
            }
        }
    }

    #[test]
    fn test_delays_are_ordered() {
        for status in [LeadStatus::Cold, LeadStatus::Warming, LeadStatus::Hot] {
            let entries = entries_for(status);
            assert_eq!(entries[0].delay_minutes, 0);
            assert!(entries.windows(2).all(|w| w[0].delay_minutes < w[1].delay_minutes));
        }
    }

    #[test]
    fn test_hot_second_message_after_a_day() {
        assert_eq!(entries_for(LeadStatus::Hot)[1].delay_minutes, 24 * 60);
        assert!(template("nope").is_none());
    }
}

//! Rendering a conversation into the wire message list.

use crate::completion::ApiMessage;
use crate::message::Role;

use super::ConversationContext;

/// The system prompt for `context`.
///
/// Starts from the conversation's override (or `base`), then appends the
/// pregnancy-week clause when the week is known and non-zero, then the
/// medical-conditions clause when any are listed.
pub fn system_prompt(context: &ConversationContext, base: &str) -> String {
    let mut prompt = context
        .system_prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or(base)
        .to_string();

    if let Some(week) = context.pregnancy_week.filter(|w| *w > 0) {
        prompt.push_str(&format!(
            " The user is currently in week {week} of pregnancy."
        ));
    }

    let conditions = context
        .user_profile
        .as_ref()
        .map(|p| p.medical_conditions.as_slice())
        .unwrap_or_default();
    if !conditions.is_empty() {
        prompt.push_str(&format!(
            " The user has reported the following medical conditions: {}.",
            conditions.join(", ")
        ));
    }

    prompt
}

/// One leading system message followed by the user/assistant history in order.
///
/// `system`-role history entries are UI notices and never reach the model.
pub fn convert_to_api_messages(context: &ConversationContext, base: &str) -> Vec<ApiMessage> {
    let mut messages = Vec::with_capacity(context.message_history.len() + 1);
    messages.push(ApiMessage::system(system_prompt(context, base)));
    messages.extend(
        context
            .message_history
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| ApiMessage::new(m.role, m.content.clone())),
    );
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessage, ConversationId, UserProfile};
    use pretty_assertions::assert_eq;

    const BASE: &str = "You are a helpful assistant.";

    fn context() -> ConversationContext {
        ConversationContext::new(ConversationId::from("c1"), None, 0)
    }

    #[test]
    fn test_base_prompt_only() {
        assert_eq!(system_prompt(&context(), BASE), BASE);
    }

    #[test]
    fn test_week_and_conditions_clauses_in_order() {
        let profile = UserProfile {
            id: "u1".to_string(),
            name: "Sam".to_string(),
            current_week_of_pregnancy: Some(24),
            medical_conditions: vec!["gestational diabetes".to_string(), "anemia".to_string()],
            ..Default::default()
        };
        let ctx = ConversationContext::new(ConversationId::from("c1"), Some(profile), 0);
        assert_eq!(
            system_prompt(&ctx, BASE),
            "You are a helpful assistant. The user is currently in week 24 of pregnancy. \
             The user has reported the following medical conditions: gestational diabetes, anemia."
        );
    }

    #[test]
    fn test_week_zero_is_omitted() {
        let mut ctx = context();
        ctx.pregnancy_week = Some(0);
        assert_eq!(system_prompt(&ctx, BASE), BASE);
    }

    #[test]
    fn test_override_replaces_base() {
        let mut ctx = context();
        ctx.system_prompt = Some("Answer briefly.".to_string());
        ctx.pregnancy_week = Some(12);
        assert_eq!(
            system_prompt(&ctx, BASE),
            "Answer briefly. The user is currently in week 12 of pregnancy."
        );
    }

    #[test]
    fn test_exactly_one_leading_system_message() {
        let mut ctx = context();
        ctx.message_history = vec![
            ChatMessage::system("API key missing", 1),
            ChatMessage::user("Is coffee ok?", 2),
            ChatMessage::assistant("In moderation.", 3),
            ChatMessage::system("Reconnected", 4),
            ChatMessage::user("Thanks", 5),
        ];

        let messages = convert_to_api_messages(&ctx, BASE);
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(messages[0].content, BASE);
        assert_eq!(messages[1].content, "Is coffee ok?");
        assert_eq!(messages[3].content, "Thanks");
    }
}

//! Demo dataset shown when neither local storage nor the server has anything.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use workit_types::models::{Attachment, AttachmentKind, Conversation, Message, Notification};

use crate::persistence::Snapshot;

/// Canned answers used by simulated replies.
pub const CANNED_REPLIES: &[&str] = &[
    "Merci pour votre message.",
    "Je vais étudier votre demande.",
    "Votre message a bien été reçu.",
    "Je reviens vers vous rapidement.",
];

pub const REPLY_NOTIFICATION: &str = "Vous avez reçu un nouveau message";

fn hours_ago(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    now - Duration::hours(hours)
}

fn message(
    id: &str,
    conversation_id: &str,
    from: &str,
    to: &str,
    content: &str,
    at: DateTime<Utc>,
    is_read: bool,
) -> Message {
    Message {
        id: id.into(),
        sender_id: from.into(),
        receiver_id: to.into(),
        conversation_id: conversation_id.into(),
        content: content.into(),
        attachments: Vec::new(),
        timestamp: at,
        is_read,
    }
}

fn conversation(
    id: &str,
    user_id: &str,
    client: &str,
    title: &str,
    created: DateTime<Utc>,
    messages: &[Message],
) -> Conversation {
    let last = messages.last();
    Conversation {
        id: id.into(),
        participants: vec![user_id.into(), client.into()],
        title: Some(title.into()),
        last_message: last.cloned().map(Box::new),
        created_at: Some(created),
        last_activity: Some(last.map(|m| m.timestamp).unwrap_or(created)),
        is_typing: None,
    }
}

/// Three client conversations for `user_id`, two of them with an unread message.
pub fn demo_dataset(user_id: &str, now: DateTime<Utc>) -> Snapshot {
    let web = vec![
        message(
            "msg_1",
            "conv_1",
            "client_1",
            user_id,
            "Bonjour, j'aimerais discuter du projet de développement web.",
            hours_ago(now, 24),
            true,
        ),
        message(
            "msg_2",
            "conv_1",
            user_id,
            "client_1",
            "Bonjour ! Bien sûr, je suis disponible pour en discuter. Quels sont vos besoins ?",
            hours_ago(now, 23),
            true,
        ),
        message(
            "msg_3",
            "conv_1",
            "client_1",
            user_id,
            "J'ai besoin d'un site e-commerce avec une intégration de paiement.",
            hours_ago(now, 2),
            false,
        ),
    ];

    let logo = vec![
        message(
            "msg_4",
            "conv_2",
            "client_2",
            user_id,
            "Pouvez-vous me créer un logo pour ma nouvelle startup ?",
            hours_ago(now, 48),
            true,
        ),
        message(
            "msg_5",
            "conv_2",
            user_id,
            "client_2",
            "Bien sûr ! Pouvez-vous me donner plus de détails sur votre entreprise ?",
            hours_ago(now, 47),
            true,
        ),
    ];

    let mut api_request = message(
        "msg_6",
        "conv_3",
        "client_3",
        user_id,
        "Bonjour, j'ai besoin d'une API pour mon application mobile.",
        hours_ago(now, 5),
        false,
    );
    api_request.attachments.push(Attachment {
        kind: AttachmentKind::File,
        url: "https://example.com/api-specs.pdf".into(),
        name: Some("API Specifications.pdf".into()),
        size: None,
        content_type: Some("application/pdf".into()),
    });
    let api = vec![api_request];

    let conversations = vec![
        conversation("conv_1", user_id, "client_1", "Développement Web Fullstack", hours_ago(now, 72), &web),
        conversation("conv_2", user_id, "client_2", "Création de Logo", hours_ago(now, 48), &logo),
        conversation("conv_3", user_id, "client_3", "Développement d'API", hours_ago(now, 24), &api),
    ];

    let notifications = vec![
        Notification {
            id: "notif_1".into(),
            conversation_id: "conv_1".into(),
            message: "Jean Dupont vous a envoyé un message".into(),
            sender: "client_1".into(),
            timestamp: hours_ago(now, 2),
            is_read: false,
        },
        Notification {
            id: "notif_2".into(),
            conversation_id: "conv_3".into(),
            message: "Marc Lefevre vous a envoyé un message".into(),
            sender: "client_3".into(),
            timestamp: hours_ago(now, 5),
            is_read: false,
        },
    ];

    Snapshot {
        conversations,
        messages: HashMap::from([
            ("conv_1".to_string(), web),
            ("conv_2".to_string(), logo),
            ("conv_3".to_string(), api),
        ]),
        notifications,
    }
}

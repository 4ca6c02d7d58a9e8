use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use classchat_types::events::{
    AckError, ConversationPayload, GatewayEvent, MessageDraft, MessagePayload, UserRef,
};
use classchat_types::models::{ConversationType, DEFAULT_GROUP_NAME};

use crate::dispatcher::{Dispatcher, conversation_channel, user_channel};
use crate::error::MessagingError;
use crate::store::{ChatStore, NewMessage};

/// Reply channel back to the connection that issued a command. A command
/// without an ack id gets no replies at all.
pub struct Ack {
    dispatcher: Dispatcher,
    conn_id: Uuid,
    id: Option<u64>,
}

impl Ack {
    pub fn new(dispatcher: Dispatcher, conn_id: Uuid, id: Option<u64>) -> Self {
        Self { dispatcher, conn_id, id }
    }

    /// "Received by the server". Sent before anything is stored, so the
    /// message carries no id yet.
    async fn received(&self, message: &MessagePayload) {
        self.reply(None, Some(message.clone())).await;
    }

    async fn failed(&self, err: &MessagingError) {
        self.reply(Some(err.to_ack_error()), None).await;
    }

    async fn reply(&self, error: Option<AckError>, message: Option<MessagePayload>) {
        let Some(ack) = self.id else {
            return;
        };
        let event = GatewayEvent::Ack { ack, error, message };
        if !self.dispatcher.send_to_connection(self.conn_id, event).await {
            debug!("ack {} dropped, connection {} is gone", ack, self.conn_id);
        }
    }
}

/// Orchestrates conversation creation, message persistence and fan-out.
pub struct Messenger<S> {
    store: Arc<S>,
    dispatcher: Dispatcher,
}

impl<S> Clone for Messenger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<S: ChatStore> Messenger<S> {
    pub fn new(store: Arc<S>, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, MessagingError>
    where
        F: FnOnce(&S) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || f(store.as_ref())).await??)
    }

    /// Join a fresh connection to its user channel, then (in the background)
    /// to every conversation the user is part of. Messages broadcast before
    /// the background step finishes are missed by this connection only.
    pub async fn bootstrap_session(&self, conn_id: Uuid, user_id: Uuid) -> JoinHandle<()> {
        self.dispatcher.subscribe(conn_id, &user_channel(user_id)).await;

        let messenger = self.clone();
        tokio::spawn(async move {
            let ids = match messenger
                .blocking(move |store| store.conversation_ids_for_user(user_id))
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    error!("Failed to load conversations for {}: {}", user_id, e);
                    return;
                }
            };

            for id in &ids {
                messenger
                    .dispatcher
                    .subscribe(conn_id, &conversation_channel(*id))
                    .await;
            }
            debug!("Connection {} joined {} conversations", conn_id, ids.len());
        })
    }

    /// Send into an existing conversation. Failures end up in the sender's ack.
    pub async fn send_message(&self, sender: &UserRef, draft: MessageDraft, ack: &Ack) {
        if let Err(e) = self.try_send_message(sender, draft, ack).await {
            report(sender, &e);
            ack.failed(&e).await;
        }
    }

    /// Start a conversation with `draft.receivers` and send its first
    /// message. One receiver goes down the single path, more than one
    /// creates a group.
    pub async fn create_conversation_and_send(
        &self,
        sender: &UserRef,
        draft: MessageDraft,
        ack: &Ack,
    ) {
        let result = match draft.receivers.len() {
            0 => Err(MessagingError::Validation(
                "at least one receiver is required".to_string(),
            )),
            1 => self.start_single(sender, draft, ack).await,
            _ => self.start_group(sender, draft, ack).await,
        };

        if let Err(e) = result {
            report(sender, &e);
            ack.failed(&e).await;
        }
    }

    async fn try_send_message(
        &self,
        sender: &UserRef,
        draft: MessageDraft,
        ack: &Ack,
    ) -> Result<(), MessagingError> {
        let conversation_id = draft
            .conversation_id
            .ok_or_else(|| MessagingError::Validation("conversationId is required".to_string()))?;
        validate_content(&draft)?;

        let sender_id = sender.id;
        let (exists, member) = self
            .blocking(move |store| {
                Ok((
                    store.conversation_exists(conversation_id)?,
                    store.is_participant(conversation_id, sender_id)?,
                ))
            })
            .await?;
        if !exists {
            return Err(MessagingError::NotFound(conversation_id));
        }
        if !member {
            return Err(MessagingError::Unauthorized(conversation_id));
        }

        let message = self.persist(sender, conversation_id, draft, ack).await?;
        self.dispatcher
            .broadcast(
                &conversation_channel(conversation_id),
                GatewayEvent::NewMessage(message),
            )
            .await;
        Ok(())
    }

    async fn start_single(
        &self,
        sender: &UserRef,
        mut draft: MessageDraft,
        ack: &Ack,
    ) -> Result<(), MessagingError> {
        let receiver = draft.receivers[0].clone();
        if receiver.id == sender.id {
            return Err(MessagingError::Validation(
                "cannot start a conversation with yourself".to_string(),
            ));
        }
        validate_content(&draft)?;
        self.ensure_registered(vec![receiver.id]).await?;

        let (sender_id, receiver_id, classroom_id) = (sender.id, receiver.id, draft.classroom_id);
        let existing = self
            .blocking(move |store| {
                store.find_single_conversation(sender_id, receiver_id, classroom_id)
            })
            .await?;
        if let Some(conversation_id) = existing {
            draft.conversation_id = Some(conversation_id);
            return self.try_send_message(sender, draft, ack).await;
        }

        let (conversation_id, created) = self
            .blocking(move |store| {
                store.insert_or_fetch_single_conversation(sender_id, receiver_id, classroom_id)
            })
            .await?;
        if !created {
            // Someone else created the pair's thread between our lookup and insert
            info!(
                "Single conversation {} appeared concurrently, appending to it",
                conversation_id
            );
            draft.conversation_id = Some(conversation_id);
            return self.try_send_message(sender, draft, ack).await;
        }

        info!(
            "{} ({}) started single conversation {} with {}",
            sender.name, sender.id, conversation_id, receiver.id
        );
        self.fan_out(&[sender.id, receiver.id], conversation_id).await;

        let message = self.persist(sender, conversation_id, draft, ack).await?;

        // Each side labels the thread with the other person's name
        let participants = vec![sender.clone(), receiver.clone()];
        let for_sender = ConversationPayload {
            id: conversation_id,
            conversation_name: receiver.name.clone(),
            kind: ConversationType::Single,
            creator_id: sender.id,
            classroom_id,
            participants,
        };
        let for_receiver = ConversationPayload {
            conversation_name: sender.name.clone(),
            ..for_sender.clone()
        };

        self.dispatcher
            .broadcast(
                &user_channel(sender.id),
                GatewayEvent::FirstTimeMessage {
                    new_msg: message.clone(),
                    new_convo: for_sender,
                },
            )
            .await;
        self.dispatcher
            .broadcast(
                &user_channel(receiver.id),
                GatewayEvent::FirstTimeMessage {
                    new_msg: message,
                    new_convo: for_receiver,
                },
            )
            .await;
        Ok(())
    }

    async fn start_group(
        &self,
        sender: &UserRef,
        draft: MessageDraft,
        ack: &Ack,
    ) -> Result<(), MessagingError> {
        validate_content(&draft)?;

        let mut participants = vec![sender.clone()];
        for receiver in &draft.receivers {
            if !participants.iter().any(|p| p.id == receiver.id) {
                participants.push(receiver.clone());
            }
        }
        if participants.len() < 2 {
            return Err(MessagingError::Validation(
                "a group needs at least one other participant".to_string(),
            ));
        }

        let ids: Vec<Uuid> = participants.iter().map(|p| p.id).collect();
        self.ensure_registered(ids[1..].to_vec()).await?;
        let (sender_id, classroom_id) = (sender.id, draft.classroom_id);
        let conversation_id = {
            let ids = ids.clone();
            self.blocking(move |store| {
                store.create_group_conversation(sender_id, &ids, classroom_id, DEFAULT_GROUP_NAME)
            })
            .await?
        };

        info!(
            "{} ({}) created group {} with {} participants",
            sender.name,
            sender.id,
            conversation_id,
            ids.len()
        );
        self.fan_out(&ids, conversation_id).await;

        let message = self.persist(sender, conversation_id, draft, ack).await?;

        self.dispatcher
            .broadcast(
                &conversation_channel(conversation_id),
                GatewayEvent::FirstTimeMessage {
                    new_msg: message,
                    new_convo: ConversationPayload {
                        id: conversation_id,
                        conversation_name: DEFAULT_GROUP_NAME.to_string(),
                        kind: ConversationType::Group,
                        creator_id: sender.id,
                        classroom_id,
                        participants,
                    },
                },
            )
            .await;
        Ok(())
    }

    async fn ensure_registered(&self, user_ids: Vec<Uuid>) -> Result<(), MessagingError> {
        let unknown = self
            .blocking(move |store| store.unknown_users(&user_ids))
            .await?;
        match unknown.first() {
            Some(id) => Err(MessagingError::Validation(format!("unknown receiver {}", id))),
            None => Ok(()),
        }
    }

    /// Subscribe every live connection of `user_ids` to the conversation.
    async fn fan_out(&self, user_ids: &[Uuid], conversation_id: Uuid) {
        let channel = conversation_channel(conversation_id);
        for user_id in user_ids {
            let joined = self
                .dispatcher
                .subscribe_all_connections_of(&user_channel(*user_id), &channel)
                .await;
            if joined == 0 {
                debug!("{} has no live connection for {}", user_id, channel);
            }
        }
    }

    /// Provisional ack, attachment, insert. Returns the broadcast copy of the
    /// message, which carries the stored id.
    async fn persist(
        &self,
        sender: &UserRef,
        conversation_id: Uuid,
        draft: MessageDraft,
        ack: &Ack,
    ) -> Result<MessagePayload, MessagingError> {
        let mut message = MessagePayload {
            id: None,
            sender: sender.clone(),
            message: draft.body,
            conversation_id,
            can_reply: draft.can_reply,
            attachment: draft.attachment,
            created_at: draft.created_at.unwrap_or_else(Utc::now),
        };
        ack.received(&message).await;

        let sender_id = sender.id;
        if let Some(attachment) = message.attachment.as_mut() {
            let metadata = attachment.clone();
            let attachment_id = self
                .blocking(move |store| store.persist_attachment(sender_id, &metadata))
                .await?;
            attachment.id = Some(attachment_id);
        }

        let new_message = NewMessage {
            sender_id,
            conversation_id,
            body: message.message.clone(),
            attachment_id: message.attachment.as_ref().and_then(|a| a.id),
            can_reply: message.can_reply,
        };
        let stored = self
            .blocking(move |store| store.insert_message(&new_message))
            .await?;

        message.id = Some(stored.id);
        message.created_at = stored.created_at;
        Ok(message)
    }
}

fn validate_content(draft: &MessageDraft) -> Result<(), MessagingError> {
    if draft.body.trim().is_empty() && draft.attachment.is_none() {
        return Err(MessagingError::Validation(
            "message text or attachment is required".to_string(),
        ));
    }
    Ok(())
}

fn report(sender: &UserRef, err: &MessagingError) {
    match err {
        MessagingError::Store(_) | MessagingError::Join(_) => {
            error!("{} ({}) send failed: {:#}", sender.name, sender.id, err)
        }
        _ => warn!("{} ({}) send rejected: {}", sender.name, sender.id, err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::anyhow;
    use tokio::sync::mpsc::UnboundedReceiver;

    use classchat_db::Database;
    use classchat_db::models::parse_timestamp;
    use classchat_types::events::{AckErrorCode, AttachmentPayload};

    use super::*;
    use crate::error::GENERIC_FAILURE;
    use crate::store::{AttachmentResolver, ConversationStore, MessageStore, StoredMessage};

    /// Database wrapper that can hold or reject writes and hide or break
    /// lookups.
    struct TestStore {
        db: Database,
        fail_inserts: bool,
        fail_attachments: bool,
        fail_lookups: bool,
        /// `find_single_conversation` always misses, as if another request
        /// created the thread right after the lookup.
        stale_lookups: bool,
        gate: Option<Mutex<std::sync::mpsc::Receiver<()>>>,
    }

    impl TestStore {
        fn new(db: Database) -> Self {
            Self {
                db,
                fail_inserts: false,
                fail_attachments: false,
                fail_lookups: false,
                stale_lookups: false,
                gate: None,
            }
        }
    }

    impl ConversationStore for TestStore {
        fn conversation_ids_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
            ConversationStore::conversation_ids_for_user(&self.db, user_id)
        }
        fn conversation_exists(&self, conversation_id: Uuid) -> anyhow::Result<bool> {
            if self.fail_lookups {
                return Err(anyhow!("disk I/O error"));
            }
            self.db.conversation_exists(conversation_id)
        }
        fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> anyhow::Result<bool> {
            ConversationStore::is_participant(&self.db, conversation_id, user_id)
        }
        fn find_single_conversation(
            &self,
            user_a: Uuid,
            user_b: Uuid,
            classroom_id: Option<Uuid>,
        ) -> anyhow::Result<Option<Uuid>> {
            if self.fail_lookups {
                return Err(anyhow!("disk I/O error"));
            }
            if self.stale_lookups {
                return Ok(None);
            }
            ConversationStore::find_single_conversation(&self.db, user_a, user_b, classroom_id)
        }
        fn insert_or_fetch_single_conversation(
            &self,
            creator_id: Uuid,
            other_id: Uuid,
            classroom_id: Option<Uuid>,
        ) -> anyhow::Result<(Uuid, bool)> {
            ConversationStore::insert_or_fetch_single_conversation(
                &self.db,
                creator_id,
                other_id,
                classroom_id,
            )
        }
        fn create_group_conversation(
            &self,
            creator_id: Uuid,
            participant_ids: &[Uuid],
            classroom_id: Option<Uuid>,
            name: &str,
        ) -> anyhow::Result<Uuid> {
            ConversationStore::create_group_conversation(
                &self.db,
                creator_id,
                participant_ids,
                classroom_id,
                name,
            )
        }
        fn unknown_users(&self, user_ids: &[Uuid]) -> anyhow::Result<Vec<Uuid>> {
            self.db.unknown_users(user_ids)
        }
    }

    impl MessageStore for TestStore {
        fn insert_message(&self, message: &NewMessage) -> anyhow::Result<StoredMessage> {
            if let Some(gate) = &self.gate {
                gate.lock().unwrap().recv().unwrap();
            }
            if self.fail_inserts {
                return Err(anyhow!("database is locked"));
            }
            MessageStore::insert_message(&self.db, message)
        }
    }

    impl AttachmentResolver for TestStore {
        fn persist_attachment(
            &self,
            uploader_id: Uuid,
            attachment: &AttachmentPayload,
        ) -> anyhow::Result<Uuid> {
            if self.fail_attachments {
                return Err(anyhow!("attachment table is read-only"));
            }
            self.db.persist_attachment(uploader_id, attachment)
        }
    }

    struct Harness {
        messenger: Messenger<TestStore>,
        store: Arc<TestStore>,
        alice: UserRef,
        bob: UserRef,
        carol: UserRef,
    }

    fn user(name: &str) -> UserRef {
        UserRef { id: Uuid::new_v4(), name: name.to_string(), avatar_url: None }
    }

    fn harness_with(configure: impl FnOnce(&mut TestStore)) -> Harness {
        let db = Database::open_in_memory().unwrap();
        let (alice, bob, carol) = (user("A"), user("B"), user("C"));
        for u in [&alice, &bob, &carol] {
            db.create_user(&u.id.to_string(), &u.name.to_lowercase(), &u.name, None, "x")
                .unwrap();
        }
        let mut store = TestStore::new(db);
        configure(&mut store);
        let store = Arc::new(store);
        Harness {
            messenger: Messenger::new(store.clone(), Dispatcher::new()),
            store,
            alice,
            bob,
            carol,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    impl Harness {
        async fn connect(&self, user: &UserRef) -> (Uuid, UnboundedReceiver<GatewayEvent>) {
            let (conn_id, rx) = self.messenger.dispatcher().register_connection(user.id).await;
            self.messenger
                .bootstrap_session(conn_id, user.id)
                .await
                .await
                .unwrap();
            (conn_id, rx)
        }

        fn ack(&self, conn_id: Uuid, id: u64) -> Ack {
            Ack::new(self.messenger.dispatcher().clone(), conn_id, Some(id))
        }

        fn conversations_of(&self, user: &UserRef) -> Vec<Uuid> {
            ConversationStore::conversation_ids_for_user(&self.store.db, user.id).unwrap()
        }
    }

    fn draft(body: &str) -> MessageDraft {
        MessageDraft {
            body: body.to_string(),
            can_reply: true,
            ..MessageDraft::default()
        }
    }

    fn to(receivers: &[&UserRef], body: &str) -> MessageDraft {
        MessageDraft {
            receivers: receivers.iter().map(|u| (*u).clone()).collect(),
            ..draft(body)
        }
    }

    fn drain(rx: &mut UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn first_time(events: &[GatewayEvent]) -> Vec<(MessagePayload, ConversationPayload)> {
        events
            .iter()
            .filter_map(|e| match e {
                GatewayEvent::FirstTimeMessage { new_msg, new_convo } => {
                    Some((new_msg.clone(), new_convo.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn new_messages(events: &[GatewayEvent]) -> Vec<MessagePayload> {
        events
            .iter()
            .filter_map(|e| match e {
                GatewayEvent::NewMessage(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn acks(events: &[GatewayEvent]) -> Vec<GatewayEvent> {
        events
            .iter()
            .filter(|e| matches!(e, GatewayEvent::Ack { .. }))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn first_single_message_labels_each_side_with_the_other_name() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 1))
            .await;

        let convos = h.conversations_of(&h.alice);
        assert_eq!(convos.len(), 1);
        assert_eq!(h.conversations_of(&h.bob), convos);

        let alice_events = drain(&mut alice_rx);
        let bob_events = drain(&mut bob_rx);

        let alice_first = first_time(&alice_events);
        let bob_first = first_time(&bob_events);
        assert_eq!(alice_first.len(), 1);
        assert_eq!(bob_first.len(), 1);
        assert_eq!(alice_first[0].1.conversation_name, "B");
        assert_eq!(bob_first[0].1.conversation_name, "A");
        assert_eq!(alice_first[0].1.kind, ConversationType::Single);
        assert_eq!(alice_first[0].1.id, convos[0]);
        assert!(alice_first[0].0.id.is_some());
        assert_eq!(alice_first[0].0, bob_first[0].0);

        // Both connections were fanned into the new conversation channel
        let channel = conversation_channel(convos[0]);
        assert_eq!(h.messenger.dispatcher().subscriber_count(&channel).await, 2);

        // Only the sender got an ack, and it predates the id
        assert_eq!(acks(&bob_events).len(), 0);
        match &alice_events[0] {
            GatewayEvent::Ack { ack: 1, error: None, message: Some(m) } => {
                assert!(m.id.is_none());
                assert_eq!(m.message, "hi");
            }
            other => panic!("expected provisional ack first, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn existing_pair_reuses_the_conversation() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 1))
            .await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        // Bob answers through the "new conversation" flow, from the other side
        let (bob_conn2, _) = h.messenger.dispatcher().register_connection(h.bob.id).await;
        h.messenger
            .create_conversation_and_send(&h.bob, to(&[&h.alice], "hello"), &h.ack(bob_conn2, 2))
            .await;

        let convos = h.conversations_of(&h.alice);
        assert_eq!(convos.len(), 1);

        let alice_events = drain(&mut alice_rx);
        assert!(first_time(&alice_events).is_empty());
        let delivered = new_messages(&alice_events);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].conversation_id, convos[0]);
        assert_eq!(delivered[0].message, "hello");
        assert_eq!(delivered[0].sender.id, h.bob.id);
    }

    #[tokio::test]
    async fn same_pair_in_another_classroom_gets_a_new_thread() {
        let h = harness();
        let (alice_conn, _alice_rx) = h.connect(&h.alice).await;

        let mut in_class = to(&[&h.bob], "hi");
        in_class.classroom_id = Some(Uuid::new_v4());
        h.messenger
            .create_conversation_and_send(&h.alice, in_class, &h.ack(alice_conn, 1))
            .await;
        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 2))
            .await;

        assert_eq!(h.conversations_of(&h.bob).len(), 2);
    }

    #[tokio::test]
    async fn group_is_always_new_and_broadcast_once() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;
        let (_carol_conn, mut carol_rx) = h.connect(&h.carol).await;

        for ack in [1, 2] {
            h.messenger
                .create_conversation_and_send(
                    &h.alice,
                    to(&[&h.bob, &h.carol], "welcome"),
                    &h.ack(alice_conn, ack),
                )
                .await;
        }
        assert_eq!(h.conversations_of(&h.carol).len(), 2);

        for rx in [&mut alice_rx, &mut bob_rx, &mut carol_rx] {
            let events = drain(rx);
            let first = first_time(&events);
            // One broadcast per group, identical for every participant
            assert_eq!(first.len(), 2);
            assert_ne!(first[0].1.id, first[1].1.id);
            for (msg, convo) in &first {
                assert_eq!(convo.conversation_name, DEFAULT_GROUP_NAME);
                assert_eq!(convo.kind, ConversationType::Group);
                assert_eq!(convo.participants.len(), 3);
                assert!(msg.id.is_some());
            }
        }
    }

    #[tokio::test]
    async fn send_message_broadcasts_to_conversation_channel() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;
        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 1))
            .await;
        let conversation_id = h.conversations_of(&h.alice)[0];
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let mut reply = draft("no replies please");
        reply.conversation_id = Some(conversation_id);
        reply.can_reply = false;
        h.messenger.send_message(&h.alice, reply, &h.ack(alice_conn, 2)).await;

        let bob_msgs = new_messages(&drain(&mut bob_rx));
        assert_eq!(bob_msgs.len(), 1);
        assert!(bob_msgs[0].id.is_some());
        assert!(!bob_msgs[0].can_reply);

        let alice_events = drain(&mut alice_rx);
        assert_eq!(acks(&alice_events).len(), 1);
        assert_eq!(new_messages(&alice_events).len(), 1);
    }

    #[tokio::test]
    async fn attachment_is_persisted_before_the_message() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;
        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 1))
            .await;
        let conversation_id = h.conversations_of(&h.alice)[0];
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let mut with_file = draft("");
        with_file.conversation_id = Some(conversation_id);
        with_file.attachment = Some(AttachmentPayload {
            id: None,
            file_name: "homework.pdf".into(),
            mime_type: "application/pdf".into(),
            size: 1024,
            url: "https://files.example/homework.pdf".into(),
        });
        h.messenger.send_message(&h.alice, with_file, &h.ack(alice_conn, 2)).await;

        let provisional = match &drain(&mut alice_rx)[0] {
            GatewayEvent::Ack { message: Some(m), .. } => m.clone(),
            other => panic!("expected ack, got {other:?}"),
        };
        assert!(provisional.attachment.as_ref().unwrap().id.is_none());

        let delivered = new_messages(&drain(&mut bob_rx));
        let attachment_id = delivered[0].attachment.as_ref().unwrap().id;
        assert!(attachment_id.is_some());

        let page = h.store.db.get_messages(&conversation_id.to_string(), 1, None).unwrap();
        assert_eq!(
            page[0].attachment.as_ref().map(|a| a.id.clone()),
            attachment_id.map(|id| id.to_string())
        );
    }

    #[tokio::test]
    async fn ack_fires_before_the_insert_resolves() {
        let (release, gate) = std::sync::mpsc::channel();
        let h = harness_with(move |s| s.gate = Some(Mutex::new(gate)));
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;

        let messenger = h.messenger.clone();
        let (alice, bob) = (h.alice.clone(), h.bob.clone());
        let ack = h.ack(alice_conn, 9);
        let task = tokio::spawn(async move {
            messenger
                .create_conversation_and_send(&alice, to(&[&bob], "hi"), &ack)
                .await;
        });

        let first = tokio::time::timeout(Duration::from_secs(5), alice_rx.recv())
            .await
            .expect("ack should arrive while the insert is held")
            .unwrap();
        match first {
            GatewayEvent::Ack { ack: 9, message: Some(m), error: None } => assert!(m.id.is_none()),
            other => panic!("expected provisional ack, got {other:?}"),
        }
        assert!(bob_rx.try_recv().is_err());

        release.send(()).unwrap();
        task.await.unwrap();

        let broadcast = first_time(&drain(&mut bob_rx));
        assert_eq!(broadcast.len(), 1);
        assert!(broadcast[0].0.id.is_some());
    }

    #[tokio::test]
    async fn failed_insert_acks_an_error_and_broadcasts_nothing() {
        let h = harness_with(|s| s.fail_inserts = true);
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 4))
            .await;

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 2);
        // The provisional ack is not taken back; the error follows it
        assert!(matches!(&events[0], GatewayEvent::Ack { error: None, message: Some(_), .. }));
        match &events[1] {
            GatewayEvent::Ack { ack: 4, error: Some(err), message: None } => {
                assert_eq!(err.code, AckErrorCode::Internal);
            }
            other => panic!("expected error ack, got {other:?}"),
        }
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn zero_receivers_is_a_validation_error() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[], "hi"), &h.ack(alice_conn, 1))
            .await;

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            GatewayEvent::Ack { error: Some(err), message: None, .. } => {
                assert_eq!(err.code, AckErrorCode::Validation);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(h.conversations_of(&h.alice).is_empty());
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.alice], "me"), &h.ack(alice_conn, 1))
            .await;

        assert!(matches!(
            &drain(&mut alice_rx)[..],
            [GatewayEvent::Ack { error: Some(_), .. }]
        ));
        assert!(h.conversations_of(&h.alice).is_empty());
    }

    #[tokio::test]
    async fn non_participant_cannot_post() {
        let h = harness();
        let (alice_conn, _alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;
        let (carol_conn, mut carol_rx) = h.connect(&h.carol).await;
        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 1))
            .await;
        let conversation_id = h.conversations_of(&h.alice)[0];
        drain(&mut bob_rx);

        let mut intrusion = draft("let me in");
        intrusion.conversation_id = Some(conversation_id);
        h.messenger.send_message(&h.carol, intrusion, &h.ack(carol_conn, 5)).await;

        let events = drain(&mut carol_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            GatewayEvent::Ack { error: Some(err), message: None, .. } => {
                assert_eq!(err.code, AckErrorCode::Unauthorized);
            }
            other => panic!("expected unauthorized, got {other:?}"),
        }
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;

        let mut lost = draft("anyone?");
        lost.conversation_id = Some(Uuid::new_v4());
        h.messenger.send_message(&h.alice, lost, &h.ack(alice_conn, 1)).await;

        match &drain(&mut alice_rx)[..] {
            [GatewayEvent::Ack { error: Some(err), .. }] => {
                assert_eq!(err.code, AckErrorCode::NotFound)
            }
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bootstrap_joins_existing_conversations() {
        let h = harness();
        let (alice_conn, _alice_rx) = h.connect(&h.alice).await;
        h.messenger
            .create_conversation_and_send(
                &h.alice,
                to(&[&h.bob, &h.carol], "group"),
                &h.ack(alice_conn, 1),
            )
            .await;
        let conversation_id = h.conversations_of(&h.carol)[0];

        // Carol was offline during creation; her next connection picks it up
        let (carol_conn, _carol_rx) = h.connect(&h.carol).await;
        let channels = h.messenger.dispatcher().channels_of(carol_conn).await;
        assert!(channels.contains(&user_channel(h.carol.id)));
        assert!(channels.contains(&conversation_channel(conversation_id)));
    }

    #[tokio::test]
    async fn offline_receiver_misses_first_broadcast() {
        let h = harness();
        let (alice_conn, _alice_rx) = h.connect(&h.alice).await;

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 1))
            .await;

        // Bob connects afterwards: nothing is replayed
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn commands_without_ack_id_get_no_reply() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let silent = Ack::new(h.messenger.dispatcher().clone(), alice_conn, None);

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[], "hi"), &silent)
            .await;

        assert!(drain(&mut alice_rx).is_empty());
    }

    fn homework() -> AttachmentPayload {
        AttachmentPayload {
            id: None,
            file_name: "homework.pdf".into(),
            mime_type: "application/pdf".into(),
            size: 1024,
            url: "https://files.example/homework.pdf".into(),
        }
    }

    fn only_error(events: &[GatewayEvent]) -> AckError {
        match events {
            [GatewayEvent::Ack { error: Some(err), message: None, .. }] => err.clone(),
            other => panic!("expected a single error ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn losing_the_create_race_appends_to_the_winner() {
        let h = harness_with(|s| s.stale_lookups = true);
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (bob_conn, mut bob_rx) = h.connect(&h.bob).await;

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 1))
            .await;
        let convos = h.conversations_of(&h.alice);
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        // Bob's lookup misses, so his insert hits the existing pair key
        h.messenger
            .create_conversation_and_send(&h.bob, to(&[&h.alice], "hey"), &h.ack(bob_conn, 2))
            .await;

        assert_eq!(h.conversations_of(&h.bob), convos);
        let alice_events = drain(&mut alice_rx);
        assert!(first_time(&alice_events).is_empty());
        let delivered = new_messages(&alice_events);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].conversation_id, convos[0]);
        assert_eq!(delivered[0].message, "hey");
        assert!(delivered[0].id.is_some());
    }

    #[tokio::test]
    async fn failed_attachment_acks_an_error_and_stores_nothing() {
        let h = harness_with(|s| s.fail_attachments = true);
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;
        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 1))
            .await;
        let conversation_id = h.conversations_of(&h.alice)[0];
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let mut with_file = draft("see attached");
        with_file.conversation_id = Some(conversation_id);
        with_file.attachment = Some(homework());
        h.messenger.send_message(&h.alice, with_file, &h.ack(alice_conn, 2)).await;

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], GatewayEvent::Ack { error: None, message: Some(_), .. }));
        match &events[1] {
            GatewayEvent::Ack { ack: 2, error: Some(err), message: None } => {
                assert_eq!(err.code, AckErrorCode::Internal);
                assert_eq!(err.message, GENERIC_FAILURE);
            }
            other => panic!("expected error ack, got {other:?}"),
        }
        assert!(drain(&mut bob_rx).is_empty());

        let history = h.store.db.get_messages(&conversation_id.to_string(), 10, None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "hi");
    }

    #[tokio::test]
    async fn failed_lookup_is_a_generic_error() {
        let h = harness_with(|s| s.fail_lookups = true);
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;

        let mut existing = draft("hello?");
        existing.conversation_id = Some(Uuid::new_v4());
        h.messenger.send_message(&h.alice, existing, &h.ack(alice_conn, 1)).await;
        let err = only_error(&drain(&mut alice_rx));
        assert_eq!(err.code, AckErrorCode::Internal);
        assert_eq!(err.message, GENERIC_FAILURE);

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 2))
            .await;
        assert_eq!(only_error(&drain(&mut alice_rx)).code, AckErrorCode::Internal);
        assert!(drain(&mut bob_rx).is_empty());
        assert!(h.conversations_of(&h.alice).is_empty());
    }

    #[tokio::test]
    async fn blank_message_without_attachment_is_rejected() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "  "), &h.ack(alice_conn, 1))
            .await;
        assert_eq!(only_error(&drain(&mut alice_rx)).code, AckErrorCode::Validation);
        assert!(h.conversations_of(&h.alice).is_empty());

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 2))
            .await;
        let conversation_id = h.conversations_of(&h.alice)[0];
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let mut blank = draft("");
        blank.conversation_id = Some(conversation_id);
        h.messenger.send_message(&h.alice, blank, &h.ack(alice_conn, 3)).await;
        assert_eq!(only_error(&drain(&mut alice_rx)).code, AckErrorCode::Validation);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn broadcast_timestamp_matches_history() {
        let h = harness();
        let (alice_conn, _alice_rx) = h.connect(&h.alice).await;
        let (_bob_conn, mut bob_rx) = h.connect(&h.bob).await;

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&h.bob], "hi"), &h.ack(alice_conn, 1))
            .await;
        let (broadcast, convo) = first_time(&drain(&mut bob_rx)).remove(0);

        let history = h.store.db.get_messages(&convo.id.to_string(), 1, None).unwrap();
        assert_eq!(history[0].id, broadcast.id.unwrap().to_string());
        assert_eq!(parse_timestamp(&history[0].created_at), Some(broadcast.created_at));
    }

    #[tokio::test]
    async fn unknown_receiver_is_a_validation_error() {
        let h = harness();
        let (alice_conn, mut alice_rx) = h.connect(&h.alice).await;
        let ghost = user("Ghost");

        h.messenger
            .create_conversation_and_send(&h.alice, to(&[&ghost], "hi"), &h.ack(alice_conn, 1))
            .await;
        assert_eq!(only_error(&drain(&mut alice_rx)).code, AckErrorCode::Validation);

        h.messenger
            .create_conversation_and_send(
                &h.alice,
                to(&[&h.bob, &ghost], "hi all"),
                &h.ack(alice_conn, 2),
            )
            .await;
        assert_eq!(only_error(&drain(&mut alice_rx)).code, AckErrorCode::Validation);
        assert!(h.conversations_of(&h.alice).is_empty());
    }
}

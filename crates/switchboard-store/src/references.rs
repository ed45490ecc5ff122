use dashmap::DashMap;
use switchboard_core::conversation::ConversationReference;
use switchboard_core::ids::Identity;

/// Latest conversation reference seen for each identity.
#[derive(Default)]
pub struct ReferenceCache {
    references: DashMap<Identity, ConversationReference>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite unconditionally; references rotate, the latest one wins.
    pub fn put(&self, identity: &Identity, reference: ConversationReference) {
        self.references.insert(identity.clone(), reference);
    }

    pub fn get(&self, identity: &Identity) -> Option<ConversationReference> {
        self.references.get(identity).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::conversation::ConversationAccount;

    fn reference(conversation: &str) -> ConversationReference {
        ConversationReference {
            conversation: ConversationAccount {
                id: conversation.into(),
            },
            channel_id: "msteams".into(),
            service_url: "https://smba.example.net/".into(),
            ..Default::default()
        }
    }

    #[test]
    fn get_missing_is_none() {
        let cache = ReferenceCache::new();
        assert!(cache.get(&Identity::from_raw("u1")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn put_overwrites_previous_reference() {
        let cache = ReferenceCache::new();
        let u1 = Identity::from_raw("u1");
        cache.put(&u1, reference("conv-a"));
        cache.put(&u1, reference("conv-b"));
        assert_eq!(cache.get(&u1).unwrap().conversation.id, "conv-b");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn identities_are_independent() {
        let cache = ReferenceCache::new();
        cache.put(&Identity::from_raw("u1"), reference("conv-1"));
        cache.put(&Identity::from_raw("u2"), reference("conv-2"));
        assert_eq!(cache.get(&Identity::from_raw("u1")).unwrap().conversation.id, "conv-1");
        assert_eq!(cache.get(&Identity::from_raw("u2")).unwrap().conversation.id, "conv-2");
    }
}

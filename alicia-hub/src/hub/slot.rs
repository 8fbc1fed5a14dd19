//! Single-holder claim cell for the agent, voice and assistant roles.
//!
//! A claim always succeeds and replaces the previous holder. Release is
//! conditional: a holder that has already been replaced cannot clear the
//! slot out from under its replacement.

use tokio::sync::RwLock;

pub struct ExclusiveSlot<T> {
    holder: RwLock<Option<T>>,
}

impl<T: Clone> ExclusiveSlot<T> {
    pub fn new() -> Self {
        Self {
            holder: RwLock::new(None),
        }
    }

    /// Install `holder`, returning whoever held the slot before.
    pub async fn claim(&self, holder: T) -> Option<T> {
        self.holder.write().await.replace(holder)
    }

    /// Clear the slot only if the current holder satisfies `is_holder`.
    pub async fn release_if(&self, is_holder: impl FnOnce(&T) -> bool) -> bool {
        let mut slot = self.holder.write().await;
        match slot.as_ref() {
            Some(current) if is_holder(current) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Clear unconditionally, returning the removed holder.
    pub async fn clear(&self) -> Option<T> {
        self.holder.write().await.take()
    }

    pub async fn current(&self) -> Option<T> {
        self.holder.read().await.clone()
    }

    pub async fn is_held(&self) -> bool {
        self.holder.read().await.is_some()
    }
}

impl<T: Clone> Default for ExclusiveSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_claim_wins() {
        let slot = ExclusiveSlot::new();
        assert_eq!(slot.claim(1).await, None);
        assert_eq!(slot.claim(2).await, Some(1));
        assert_eq!(slot.current().await, Some(2));
    }

    #[tokio::test]
    async fn test_replaced_holder_cannot_release() {
        let slot = ExclusiveSlot::new();
        slot.claim("old").await;
        slot.claim("new").await;

        assert!(!slot.release_if(|h| *h == "old").await);
        assert_eq!(slot.current().await, Some("new"));

        assert!(slot.release_if(|h| *h == "new").await);
        assert!(!slot.is_held().await);
    }

    #[tokio::test]
    async fn test_clear() {
        let slot = ExclusiveSlot::new();
        slot.claim(7u32).await;
        assert_eq!(slot.clear().await, Some(7));
        assert_eq!(slot.clear().await, None);
    }
}

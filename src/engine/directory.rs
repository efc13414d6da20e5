use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Lookups the engine needs from the user and professional directory.
pub trait Directory {
    fn find_user_by_id(&self, id: Ulid) -> Option<UserRecord>;
    fn find_professional_by_user_id(&self, user_id: Ulid) -> Option<ProfessionalRecord>;
    fn find_professional_by_id(&self, id: Ulid) -> Option<ProfessionalRecord>;

    /// Resolve a verified user id into the caller the engine authorizes against.
    /// A user with a professional profile acts as that professional.
    fn resolve_caller(&self, user_id: Ulid) -> Result<Caller, EngineError> {
        self.find_user_by_id(user_id)
            .ok_or(EngineError::NotFound(user_id))?;
        let role = match self.find_professional_by_user_id(user_id) {
            Some(p) => Role::Professional(p.id),
            None => Role::Client,
        };
        Ok(Caller { user_id, role })
    }
}

impl Directory for Engine {
    fn find_user_by_id(&self, id: Ulid) -> Option<UserRecord> {
        self.users.get(&id).map(|e| e.value().clone())
    }

    fn find_professional_by_user_id(&self, user_id: Ulid) -> Option<ProfessionalRecord> {
        let id = *self.professional_by_user.get(&user_id)?;
        self.find_professional_by_id(id)
    }

    fn find_professional_by_id(&self, id: Ulid) -> Option<ProfessionalRecord> {
        self.professionals.get(&id).map(|e| e.value().clone())
    }
}

impl Engine {
    pub async fn register_user(&self, id: Ulid, role: UserRole) -> Result<UserRecord, EngineError> {
        let _directory = self.directory_lock.lock().await;
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        self.append_directory(Event::UserRegistered { id, role }).await?;
        Ok(UserRecord { id, role })
    }

    /// Attach a professional profile (and its calendar) to an existing user.
    pub async fn register_professional(
        &self,
        id: Ulid,
        user_id: Ulid,
        name: Option<String>,
    ) -> Result<ProfessionalRecord, EngineError> {
        if let Some(n) = &name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("professional name too long"));
        }
        let _directory = self.directory_lock.lock().await;
        if self.professionals.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.users.contains_key(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }
        if self.professional_by_user.contains_key(&user_id) {
            return Err(EngineError::AlreadyExists(user_id));
        }
        if self.professionals.len() >= MAX_PROFESSIONALS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many professionals"));
        }
        self.append_directory(Event::ProfessionalRegistered { id, user_id, name: name.clone() })
            .await?;
        tracing::info!("registered professional {id} for user {user_id}");
        Ok(ProfessionalRecord { id, user_id, name })
    }

    /// Caller holds the directory lock.
    async fn append_directory(&self, event: Event) -> Result<(), EngineError> {
        self.log
            .append(vec![event.clone()])
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        self.apply_directory(&event);
        Ok(())
    }
}

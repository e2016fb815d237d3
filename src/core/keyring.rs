const SERVICE: &str = "inbox-sync";

fn key_id(app_id: &str, person_key: &str) -> String {
    format!("{person_key}@{app_id}")
}

/// API token stored for one person of one app.
pub fn get_token(app_id: &str, person_key: &str) -> Result<String, String> {
    let key = key_id(app_id, person_key);
    log::debug!("keyring GET: service={SERVICE:?} key={key:?}");
    let entry = keyring::Entry::new(SERVICE, &key).map_err(|e| {
        log::error!("keyring Entry::new failed for key={key:?}: {e}");
        format!("keyring error: {e}")
    })?;
    entry.get_password().map_err(|e| {
        log::warn!("keyring get_password failed for key={key:?}: {e}");
        format!("keyring get: {e}")
    })
}

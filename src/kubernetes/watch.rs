use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::try_join_all;
use futures_util::StreamExt;
use kube::api::{Api, DynamicObject, ListParams, TypeMeta, WatchEvent, WatchParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tokio::task::JoinHandle;

use crate::cache::ResourceCache;
use crate::error::{AppError, AppResult};
use crate::kubernetes::discovery;
use crate::resource::{Resource, ResourceIdentifier};

/// Predicate marking which observed objects belong to this controller
pub type IsManaged = Arc<dyn Fn(&DynamicObject) -> bool + Send + Sync>;

/// Minimum spacing between watch reconnection attempts
const WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Page size for the initial list of each kind
const LIST_PAGE_SIZE: u32 = 500;

/// Populates the cluster-state cache with an initial list of every
/// discoverable kind and keeps it current with one detached watch task per
/// kind.
pub struct WatchEngine {
    client: Client,
    cache: ResourceCache,
    watches: Mutex<Vec<JoinHandle<()>>>,
}

impl WatchEngine {
    pub fn new(client: Client, cache: ResourceCache) -> Self {
        WatchEngine {
            client,
            cache,
            watches: Mutex::new(Vec::new()),
        }
    }

    /// List every qualifying kind into the cache, then (optionally) start the
    /// watch tasks. Lists run concurrently; the first failure aborts the
    /// remaining ones and surfaces.
    pub async fn preload(&self, is_managed: IsManaged, live_update: bool) -> AppResult<()> {
        let resources = discovery::server_preferred_resources(&self.client).await?;
        log::info!("Preloading cache for {} resource kinds", resources.len());

        let syncs = resources
            .into_iter()
            .map(|(ar, _)| self.sync_resource(ar, is_managed.clone(), live_update));
        try_join_all(syncs).await?;

        log::info!("Cache preloaded with {} objects", self.cache.len());
        Ok(())
    }

    async fn sync_resource(
        &self,
        ar: ApiResource,
        is_managed: IsManaged,
        live_update: bool,
    ) -> AppResult<()> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let cursor = list_into_cache(&api, &ar, &self.cache, &is_managed).await?;

        if live_update {
            let handle = tokio::spawn(watch_resource(
                api,
                ar,
                cursor,
                self.cache.clone(),
                is_managed,
            ));
            if let Ok(mut watches) = self.watches.lock() {
                watches.push(handle);
            }
        }

        Ok(())
    }

    /// Stop every watch task. The cache keeps its entries.
    pub fn shutdown(&self) {
        if let Ok(mut watches) = self.watches.lock() {
            for handle in watches.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// List all instances of one kind into the cache, paginated, returning the
/// collection's resource version as the watch cursor.
async fn list_into_cache(
    api: &Api<DynamicObject>,
    ar: &ApiResource,
    cache: &ResourceCache,
    is_managed: &IsManaged,
) -> AppResult<String> {
    let mut lp = ListParams::default().limit(LIST_PAGE_SIZE);
    let mut continue_token: Option<String> = None;
    let mut cursor = String::new();

    loop {
        if let Some(token) = continue_token.clone() {
            lp = ListParams {
                continue_token: Some(token),
                ..lp.clone()
            };
        }

        let list = api.list(&lp).await?;

        if let Some(rv) = &list.metadata.resource_version {
            cursor = rv.clone();
        }

        for obj in list.items {
            insert_object(cache, ar, is_managed, obj, false);
        }

        continue_token = list
            .metadata
            .continue_
            .and_then(|x| if x.is_empty() { None } else { Some(x) });

        if continue_token.is_none() {
            break;
        }
    }

    log::debug!("Listed {} at resourceVersion {}", ar.plural, cursor);
    Ok(cursor)
}

/// Build a cache entry from an observed object.
///
/// The full object graph is kept for managed objects and for everything a
/// watch event delivers; unmanaged listed objects only carry identity, which
/// bounds preload memory. A malformed object is logged and skipped.
fn insert_object(
    cache: &ResourceCache,
    ar: &ApiResource,
    is_managed: &IsManaged,
    mut obj: DynamicObject,
    from_watch: bool,
) {
    // list responses omit item TypeMeta; patch it back in from discovery
    obj.types = obj.types.or(Some(TypeMeta {
        api_version: ar.api_version.clone(),
        kind: ar.kind.clone(),
    }));

    let managed = is_managed(&obj);
    match Resource::from_object(&obj, "", &ar.plural, managed) {
        Ok(resource) => {
            let resource = if managed || from_watch {
                resource
            } else {
                resource.without_object()
            };
            cache.set(&resource.key(), resource);
        }
        Err(e) => {
            log::warn!("Skipping malformed {} object: {}", ar.plural, e);
        }
    }
}

/// Resumable watch loop for one kind. Runs until aborted; disconnects are
/// retried forever with `WATCH_RETRY_INTERVAL` spacing, and an expired cursor
/// triggers a fresh list.
async fn watch_resource(
    api: Api<DynamicObject>,
    ar: ApiResource,
    mut cursor: String,
    cache: ResourceCache,
    is_managed: IsManaged,
) {
    let wp = WatchParams::default();

    loop {
        let stream = match api.watch(&wp, &cursor).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Watch connect failed for {}: {}", ar.plural, e);
                if AppError::is_expired_cursor(&e) {
                    refresh_cursor(&api, &ar, &cache, &is_managed, &mut cursor).await;
                }
                tokio::time::sleep(WATCH_RETRY_INTERVAL).await;
                continue;
            }
        };
        let mut stream = stream.boxed();

        let mut expired = false;
        loop {
            match stream.next().await {
                Some(Ok(event)) => {
                    if let Some(rv) = apply_watch_event(&cache, &ar, &is_managed, event, &mut expired)
                    {
                        cursor = rv;
                    }
                    if expired {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Watch stream error for {}: {}", ar.plural, e);
                    break;
                }
                None => {
                    log::debug!("Watch stream ended for {}", ar.plural);
                    break;
                }
            }
        }

        tokio::time::sleep(WATCH_RETRY_INTERVAL).await;
        if expired {
            refresh_cursor(&api, &ar, &cache, &is_managed, &mut cursor).await;
        }
    }
}

async fn refresh_cursor(
    api: &Api<DynamicObject>,
    ar: &ApiResource,
    cache: &ResourceCache,
    is_managed: &IsManaged,
    cursor: &mut String,
) {
    match list_into_cache(api, ar, cache, is_managed).await {
        Ok(rv) => *cursor = rv,
        Err(e) => log::warn!("Relist failed for {}: {}", ar.plural, e),
    }
}

/// Fold one watch event into the cache, returning the cursor it carries.
///
/// `expired` is set when the server reports the 410 Gone status that makes
/// the current cursor unusable.
fn apply_watch_event(
    cache: &ResourceCache,
    ar: &ApiResource,
    is_managed: &IsManaged,
    event: WatchEvent<DynamicObject>,
    expired: &mut bool,
) -> Option<String> {
    match event {
        WatchEvent::Deleted(obj) => {
            let cursor = obj.resource_version();
            match ResourceIdentifier::from_object(&obj, "") {
                Ok(identifier) => {
                    let key = identifier.key();
                    if cache.has(&key) {
                        cache.delete(&key);
                    }
                }
                Err(e) => log::warn!("Skipping malformed {} delete event: {}", ar.plural, e),
            }
            cursor
        }
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
            let cursor = obj.resource_version();
            insert_object(cache, ar, is_managed, obj, true);
            cursor
        }
        // bookmarks carry no object graph, only a fresher cursor
        WatchEvent::Bookmark(bookmark) => Some(bookmark.metadata.resource_version),
        WatchEvent::Error(e) => {
            if e.code == 410 {
                log::info!("Watch cursor for {} expired, relisting", ar.plural);
                *expired = true;
            } else {
                log::warn!("Watch error event for {}: {}", ar.plural, e.message);
            }
            None
        }
    }
}

//! Authorization: which methods and topics a connection may see.
//!
//! Requirements are plain data attached to methods and topics at
//! registration. A backend turns a connection's [`Credentials`] plus the
//! registered tables into a [`Visibility`]; the dispatcher only ever
//! consults that result.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use {
    async_trait::async_trait,
    serde_json::{Value, json},
    sha2::{Digest, Sha256},
};

use crate::method::{JsonKind, MethodDescriptor, Request};

pub type MethodTable = HashMap<String, Arc<MethodDescriptor>>;
pub type TopicTable = HashMap<String, Requirements>;

// ── Credentials ──────────────────────────────────────────────────────────────

/// Identity of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: Option<String>,
    pub permissions: BTreeSet<String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user<I, S>(name: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user: Some(name.into()),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

// ── Requirements ─────────────────────────────────────────────────────────────

pub type UserTest = Arc<dyn Fn(&Credentials) -> bool + Send + Sync>;

/// Access requirements for one method or topic.
#[derive(Clone, Default)]
pub struct Requirements {
    pub login_required: bool,
    pub permissions: BTreeSet<String>,
    pub tests: Vec<UserTest>,
}

impl Requirements {
    #[must_use]
    pub fn login_required(mut self) -> Self {
        self.login_required = true;
        self
    }

    #[must_use]
    pub fn permission_required(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    #[must_use]
    pub fn user_test(mut self, test: impl Fn(&Credentials) -> bool + Send + Sync + 'static) -> Self {
        self.tests.push(Arc::new(test));
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.login_required && self.permissions.is_empty() && self.tests.is_empty()
    }

    pub fn is_satisfied_by(&self, credentials: &Credentials) -> bool {
        if self.login_required && !credentials.is_authenticated() {
            return false;
        }
        if !self.permissions.is_subset(&credentials.permissions) {
            return false;
        }
        self.tests.iter().all(|test| test(credentials))
    }
}

impl fmt::Debug for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requirements")
            .field("login_required", &self.login_required)
            .field("permissions", &self.permissions)
            .field("tests", &self.tests.len())
            .finish()
    }
}

// ── Backend interface ────────────────────────────────────────────────────────

/// The methods and topics one connection may use.
#[derive(Debug, Clone, Default)]
pub struct Visibility {
    pub methods: MethodTable,
    pub topics: HashSet<String>,
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Resolve the token presented when the transport was opened.
    async fn authenticate(&self, _token: Option<&str>) -> Credentials {
        Credentials::anonymous()
    }

    /// Compute what `credentials` may see. Called when a connection opens and
    /// again whenever its identity changes; must not have side effects.
    async fn prepare(
        &self,
        methods: &MethodTable,
        topics: &TopicTable,
        credentials: &Credentials,
    ) -> Visibility;

    /// Extra methods this backend contributes (login and the like).
    fn methods(&self) -> Vec<MethodDescriptor> {
        Vec::new()
    }
}

/// Every registered method and topic is visible to everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthBackend for AllowAll {
    async fn prepare(
        &self,
        methods: &MethodTable,
        topics: &TopicTable,
        _credentials: &Credentials,
    ) -> Visibility {
        Visibility {
            methods: methods.clone(),
            topics: topics.keys().cloned().collect(),
        }
    }
}

/// Filters methods and topics by their [`Requirements`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequirementsBackend;

impl RequirementsBackend {
    fn filter(methods: &MethodTable, topics: &TopicTable, credentials: &Credentials) -> Visibility {
        Visibility {
            methods: methods
                .iter()
                .filter(|(_, method)| method.requirements().is_satisfied_by(credentials))
                .map(|(name, method)| (name.clone(), Arc::clone(method)))
                .collect(),
            topics: topics
                .iter()
                .filter(|(_, requirements)| requirements.is_satisfied_by(credentials))
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }
}

#[async_trait]
impl AuthBackend for RequirementsBackend {
    async fn prepare(
        &self,
        methods: &MethodTable,
        topics: &TopicTable,
        credentials: &Credentials,
    ) -> Visibility {
        Self::filter(methods, topics, credentials)
    }
}

// ── Bearer tokens ────────────────────────────────────────────────────────────

/// One entry of the token table. Only the SHA-256 digest of the token is
/// kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenUser {
    pub name: String,
    digest: [u8; 32],
    pub permissions: BTreeSet<String>,
}

impl TokenUser {
    /// Build from a hex-encoded SHA-256 digest. Returns `None` for anything
    /// that is not 64 hex characters.
    pub fn from_digest_hex<I, S>(name: impl Into<String>, hex: &str, permissions: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Some(Self {
            name: name.into(),
            digest: decode_digest(hex)?,
            permissions: permissions.into_iter().map(Into::into).collect(),
        })
    }

    pub fn from_token<I, S>(name: impl Into<String>, token: &str, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            digest: Sha256::digest(token.as_bytes()).into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    fn credentials(&self) -> Credentials {
        Credentials::user(self.name.clone(), self.permissions.iter().cloned())
    }
}

/// Hex SHA-256 of `token`, the form stored in configuration.
pub fn token_digest_hex(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn decode_digest(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 || !hex.is_ascii() {
        return None;
    }
    let mut digest = [0u8; 32];
    for (slot, pair) in digest.iter_mut().zip(hex.as_bytes().chunks(2)) {
        let pair = std::str::from_utf8(pair).ok()?;
        *slot = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(digest)
}

/// Resolves bearer tokens against a fixed user table and then applies
/// [`RequirementsBackend`] rules. Contributes `login` and `logout` methods so
/// a connection can change identity after it is open.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthBackend {
    users: Arc<Vec<TokenUser>>,
}

impl TokenAuthBackend {
    pub fn new(users: impl IntoIterator<Item = TokenUser>) -> Self {
        Self {
            users: Arc::new(users.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Look up the user owning `token`. Digests are compared rather than
    /// raw tokens.
    pub fn resolve(&self, token: &str) -> Option<Credentials> {
        let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        self.users
            .iter()
            .find(|user| user.digest == digest)
            .map(TokenUser::credentials)
    }
}

#[async_trait]
impl AuthBackend for TokenAuthBackend {
    async fn authenticate(&self, token: Option<&str>) -> Credentials {
        let Some(token) = token else {
            return Credentials::anonymous();
        };
        match self.resolve(token) {
            Some(credentials) => credentials,
            None => {
                tracing::warn!("rejected unknown bearer token");
                Credentials::anonymous()
            },
        }
    }

    async fn prepare(
        &self,
        methods: &MethodTable,
        topics: &TopicTable,
        credentials: &Credentials,
    ) -> Visibility {
        RequirementsBackend::filter(methods, topics, credentials)
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor::new("login", |req: Request| async move {
                let token: String = req.param("token")?;
                let ctx = req.ctx()?;
                let credentials = ctx.dispatcher().authenticate(Some(&token)).await;
                let ok = credentials.is_authenticated();
                ctx.set_credentials(credentials).await;
                Ok(Value::Bool(ok))
            })
            .param("token")
            .validate("token", JsonKind::String),
            MethodDescriptor::new("logout", |req: Request| async move {
                req.ctx()?.set_credentials(Credentials::anonymous()).await;
                Ok(json!(true))
            })
            .login_required(),
        ]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, rstest::rstest};

    fn table() -> (MethodTable, TopicTable) {
        let open = MethodDescriptor::new("open", |_req| async { Ok(Value::Null) });
        let private = MethodDescriptor::new("private", |_req| async { Ok(Value::Null) })
            .login_required();
        let admin = MethodDescriptor::new("admin", |_req| async { Ok(Value::Null) })
            .permission_required("admin");
        let methods = [open, private, admin]
            .into_iter()
            .map(|m| (m.name().to_owned(), Arc::new(m)))
            .collect();

        let topics = [
            ("news".to_owned(), Requirements::default()),
            ("alerts".to_owned(), Requirements::default().login_required()),
            (
                "audit".to_owned(),
                Requirements::default().user_test(|c| c.user.as_deref() == Some("root")),
            ),
        ]
        .into_iter()
        .collect();
        (methods, topics)
    }

    fn names(visibility: &Visibility) -> (BTreeSet<String>, BTreeSet<String>) {
        (
            visibility.methods.keys().cloned().collect(),
            visibility.topics.iter().cloned().collect(),
        )
    }

    #[tokio::test]
    async fn allow_all_sees_everything() {
        let (methods, topics) = table();
        let vis = AllowAll
            .prepare(&methods, &topics, &Credentials::anonymous())
            .await;
        assert_eq!(vis.methods.len(), 3);
        assert_eq!(vis.topics.len(), 3);
    }

    #[rstest]
    #[case(Credentials::anonymous(), &["open"], &["news"])]
    #[case(Credentials::user("bob", Vec::<String>::new()), &["open", "private"], &["alerts", "news"])]
    #[case(Credentials::user("root", ["admin"]), &["admin", "open", "private"], &["alerts", "audit", "news"])]
    #[tokio::test]
    async fn requirements_filter_by_credentials(
        #[case] credentials: Credentials,
        #[case] expected_methods: &[&str],
        #[case] expected_topics: &[&str],
    ) {
        let (methods, topics) = table();
        let vis = RequirementsBackend
            .prepare(&methods, &topics, &credentials)
            .await;
        let (m, t) = names(&vis);
        let expect = |names: &[&str]| names.iter().map(|s| (*s).to_owned()).collect::<BTreeSet<_>>();
        assert_eq!(m, expect(expected_methods));
        assert_eq!(t, expect(expected_topics));
    }

    #[test]
    fn permission_without_login_is_enough_when_login_not_required() {
        let req = Requirements::default().permission_required("a");
        let creds = Credentials {
            user: None,
            permissions: ["a".to_owned()].into(),
        };
        assert!(req.is_satisfied_by(&creds));
        assert!(!req.clone().login_required().is_satisfied_by(&creds));
    }

    #[tokio::test]
    async fn token_backend_resolves_by_digest() {
        let hex = token_digest_hex("s3cret");
        assert_eq!(hex.len(), 64);
        let backend = TokenAuthBackend::new([
            TokenUser::from_digest_hex("admin", &hex, ["admin"]).unwrap(),
            TokenUser::from_token("guest", "guest-token", Vec::<String>::new()),
        ]);
        assert_eq!(backend.len(), 2);

        let admin = backend.authenticate(Some("s3cret")).await;
        assert_eq!(admin.user.as_deref(), Some("admin"));
        assert!(admin.has_permission("admin"));

        let guest = backend.authenticate(Some("guest-token")).await;
        assert_eq!(guest.user.as_deref(), Some("guest"));

        assert_eq!(backend.authenticate(Some("wrong")).await, Credentials::anonymous());
        assert_eq!(backend.authenticate(None).await, Credentials::anonymous());
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case(&"zz".repeat(32))]
    fn bad_digests_are_rejected(#[case] hex: &str) {
        assert!(TokenUser::from_digest_hex("x", hex, Vec::<String>::new()).is_none());
    }

    #[test]
    fn token_backend_contributes_login_methods() {
        let names: Vec<_> = TokenAuthBackend::default()
            .methods()
            .iter()
            .map(|m| m.name().to_owned())
            .collect();
        assert_eq!(names, ["login", "logout"]);
    }
}

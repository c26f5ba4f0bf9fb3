//! # Orm Module
//!
//! The facade tying the registry, the binder and sessions together.
//!
//! Skeletons can be registered before or after construction, and binding can
//! happen in the same call as construction or later:
//!
//! ```rust,ignore
//! // register, then bind
//! let mut orm = Orm::new();
//! orm.declare::<User>();
//! orm.bind("sqlite::memory:").await?;
//!
//! // construct and bind in one call
//! let mut orm = Orm::builder().declare::<User>().connect("sqlite::memory:").await?;
//!
//! let users = orm.mapped("User")?;
//! let alice = orm.get_or_create("User", fields! { "name" => "alice" }).await?;
//! orm.session()?.commit().await?;
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{
    Error, Result,
    binder::{Binding, ConnectionTarget, Reflection, SchemaBinder},
    database::Database,
    mapper::MappedType,
    object::Object,
    registry::ClassRegistry,
    session::{Session, SessionFactory, SessionOptions},
    skeleton::{ClassSkeleton, Declarations, Skeleton, TableDecl},
    value::Fields,
};

// ============================================================================
// Orm
// ============================================================================

/// Registry, current binding and default session.
#[derive(Debug)]
pub struct Orm {
    registry: ClassRegistry,
    binder: SchemaBinder,
    options: SessionOptions,
    generation: Arc<AtomicU64>,
    binding: Option<Arc<Binding>>,
    factory: Option<SessionFactory>,
    session: Option<Session>,
}

impl Default for Orm {
    fn default() -> Self {
        Self::new()
    }
}

impl Orm {
    /// An unbound ORM using deferred reflection.
    pub fn new() -> Self {
        Self {
            registry: ClassRegistry::new(),
            binder: SchemaBinder::new(Reflection::Deferred),
            options: SessionOptions::default(),
            generation: Arc::new(AtomicU64::new(0)),
            binding: None,
            factory: None,
            session: None,
        }
    }

    pub fn builder() -> OrmBuilder {
        OrmBuilder::default()
    }

    /// An unbound ORM with every class of `declarations` registered.
    pub fn with_skeletons(declarations: Declarations) -> Self {
        let mut orm = Self::new();
        orm.register_all(declarations);
        orm
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Registers a skeleton. It takes effect at the next [`bind`](Self::bind).
    pub fn register(&mut self, name: impl Into<String>, skeleton: ClassSkeleton) -> &mut Self {
        let name = name.into();
        if self.registry.register(name.clone(), skeleton).is_some() {
            log::warn!("skeleton `{}` replaced", name);
        }
        self
    }

    pub fn declare<T: Skeleton>(&mut self) -> &mut Self {
        self.register(T::class_name(), T::skeleton())
    }

    pub fn register_all(&mut self, declarations: Declarations) -> &mut Self {
        for (name, skeleton) in declarations {
            self.register(name, skeleton);
        }
        self
    }

    /// Declares a plain table, such as an association table, for eager binding.
    pub fn declare_table(&mut self, table: TableDecl) -> &mut Self {
        self.registry.declare_table(table);
        self
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Binding
    // ------------------------------------------------------------------------

    /// Binds every registered skeleton to `target`.
    ///
    /// Rebinding replaces the previous binding: the default session is
    /// closed, and sessions and mapped types from earlier bindings fail with
    /// [`Error::StaleBinding`] from then on. A failed bind leaves the previous
    /// binding and the default session in place, except when that session
    /// holds the only connection of the target database: its transaction is
    /// then rolled back before binding.
    pub async fn bind(&mut self, target: impl Into<ConnectionTarget>) -> Result<()> {
        let target = target.into();
        let next = self.generation.load(Ordering::SeqCst) + 1;

        let holds_connection = self.session.as_ref().is_some_and(Session::in_transaction)
            && matches!(&target, ConnectionTarget::Database(db) if db.max_connections() <= 1);
        if holds_connection {
            self.reset_session().await?;
        }

        let binding = Arc::new(self.binder.bind(&self.registry, target, next).await?);
        self.generation.store(next, Ordering::SeqCst);
        self.factory = Some(SessionFactory::new(Arc::clone(&binding), Arc::clone(&self.generation), self.options));
        self.binding = Some(binding);

        if let Err(err) = self.reset_session().await {
            log::warn!("closing the default session of generation {} failed: {}", next - 1, err);
        }
        Ok(())
    }

    pub async fn configure_with_database(&mut self, database: &Database) -> Result<()> {
        self.bind(database).await
    }

    pub async fn connect(&mut self, url: &str) -> Result<()> {
        self.bind(url).await
    }

    pub fn binding(&self) -> Option<&Arc<Binding>> {
        self.binding.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// The bound database.
    pub fn database(&self) -> Result<&Database> {
        Ok(self.bound()?.database())
    }

    /// Number of binds performed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bound(&self) -> Result<&Arc<Binding>> {
        self.binding.as_ref().ok_or(Error::NotBound)
    }

    // ------------------------------------------------------------------------
    // Mapped Types
    // ------------------------------------------------------------------------

    /// The mapped type for a class name.
    ///
    /// A class registered after the last bind is reported as
    /// [`Error::NotBound`].
    pub fn mapped(&self, name: &str) -> Result<Arc<MappedType>> {
        let binding = self.bound()?;
        match binding.mapped(name) {
            Ok(mapped) => Ok(Arc::clone(mapped)),
            Err(_) if self.registry.contains(name) => Err(Error::NotBound),
            Err(err) => Err(err),
        }
    }

    pub fn mapped_for_table(&self, table: &str) -> Result<Option<Arc<MappedType>>> {
        Ok(self.bound()?.mapped_for_table(table).cloned())
    }

    /// Constructs a transient object of class `name`.
    pub fn new_object(&self, name: &str, fields: Fields) -> Result<Object> {
        self.mapped(name)?.instantiate(fields)
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Opens a new session on the current binding.
    pub fn create_session(&self) -> Result<Session> {
        Ok(self.factory.as_ref().ok_or(Error::NotBound)?.new_session())
    }

    pub fn session_factory(&self) -> Result<&SessionFactory> {
        self.factory.as_ref().ok_or(Error::NotBound)
    }

    /// The default session, opened on first use.
    pub fn session(&mut self) -> Result<&mut Session> {
        let factory = self.factory.as_ref().ok_or(Error::NotBound)?;
        Ok(self.session.get_or_insert_with(|| factory.new_session()))
    }

    /// Closes the default session; the next [`session`](Self::session) call
    /// opens a fresh one.
    pub async fn reset_session(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.close().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Resolver Shortcuts
    // ------------------------------------------------------------------------

    /// [`Session::get_or_create`] on the default session.
    pub async fn get_or_create(&mut self, class: &str, predicate: Fields) -> Result<Object> {
        let mapped = self.mapped(class)?;
        self.session()?.get_or_create(&mapped, predicate).await
    }

    /// [`Session::update_object`] on the default session.
    pub fn update_object(&mut self, object: &Object, fields: Fields) -> Result<()> {
        self.session()?.update_object(object, fields)
    }

    /// [`Session::get_or_create_and_update`] on the default session.
    pub async fn get_or_create_and_update(&mut self, class: &str, predicate: Fields, fields: Fields) -> Result<Object> {
        let mapped = self.mapped(class)?;
        self.session()?.get_or_create_and_update(&mapped, predicate, fields).await
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Collects skeletons and settings, then binds in one call.
#[derive(Debug, Default)]
pub struct OrmBuilder {
    registry: ClassRegistry,
    reflection: Reflection,
    max_connections: Option<u32>,
    options: SessionOptions,
}

impl OrmBuilder {
    pub fn class(mut self, name: impl Into<String>, skeleton: ClassSkeleton) -> Self {
        self.registry.register(name, skeleton);
        self
    }

    pub fn skeletons(mut self, declarations: Declarations) -> Self {
        for (name, skeleton) in declarations {
            self.registry.register(name, skeleton);
        }
        self
    }

    pub fn declare<T: Skeleton>(mut self) -> Self {
        self.registry.declare::<T>();
        self
    }

    pub fn table(mut self, table: TableDecl) -> Self {
        self.registry.declare_table(table);
        self
    }

    /// `false` creates missing tables from the declarations instead of
    /// reflecting them.
    pub fn deferred_reflection(mut self, deferred: bool) -> Self {
        self.reflection = if deferred { Reflection::Deferred } else { Reflection::Eager };
        self
    }

    /// Pool size used when binding to a URL.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn session_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// The configured ORM, still unbound.
    pub fn build(self) -> Orm {
        let mut binder = SchemaBinder::new(self.reflection);
        if let Some(max) = self.max_connections {
            binder = binder.max_connections(max);
        }
        Orm { registry: self.registry, binder, options: self.options, ..Orm::new() }
    }

    pub async fn connect(self, url: &str) -> Result<Orm> {
        let mut orm = self.build();
        orm.bind(url).await?;
        Ok(orm)
    }

    pub async fn database(self, database: &Database) -> Result<Orm> {
        let mut orm = self.build();
        orm.bind(database).await?;
        Ok(orm)
    }
}

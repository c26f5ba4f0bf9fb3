use reflect_orm::{ClassSkeleton, Database, Declarations, Error, FieldDecl, ObjectState, Orm, RelationshipDecl, Value, fields};

async fn user_database() -> Result<Database, Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let db = Database::connect("sqlite::memory:").await?;
    db.raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, fullname TEXT)").execute().await?;
    db.raw(
        "CREATE TABLE addresses (id INTEGER PRIMARY KEY, email TEXT NOT NULL, user_id INTEGER REFERENCES users (id))",
    )
    .execute()
    .await?;
    db.raw("CREATE TABLE audit_log (id INTEGER PRIMARY KEY, message TEXT)").execute().await?;
    Ok(db)
}

fn skeletons() -> Declarations {
    Declarations::new()
        .class("User", ClassSkeleton::new("users").relationship("addresses", RelationshipDecl::new("Address").backref("user")))
        .class("Address", ClassSkeleton::new("addresses"))
}

fn assert_mapped(orm: &Orm) -> Result<(), Box<dyn std::error::Error>> {
    let users = orm.mapped("User")?;
    let addresses = orm.mapped("Address")?;

    assert_eq!(users.table_name(), "users");
    assert_eq!(users.column_attributes().collect::<Vec<_>>(), ["fullname", "id", "name"]);
    assert_eq!(addresses.column_attributes().collect::<Vec<_>>(), ["email", "id", "user_id"]);
    assert!(users.relationship("addresses").is_some_and(|r| r.kind.is_collection()));
    assert!(addresses.relationship("user").is_some_and(|r| !r.kind.is_collection()));
    Ok(())
}

#[tokio::test]
async fn test_register_then_bind() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;

    let mut orm = Orm::new();
    assert!(matches!(orm.mapped("User"), Err(Error::NotBound)));
    assert!(matches!(orm.create_session(), Err(Error::NotBound)));

    orm.register_all(skeletons());
    orm.configure_with_database(&db).await?;
    assert_mapped(&orm)?;
    assert_eq!(orm.generation(), 1);
    Ok(())
}

#[tokio::test]
async fn test_construct_with_skeletons_then_bind() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;

    let mut orm = Orm::with_skeletons(skeletons());
    assert!(!orm.is_bound());
    orm.bind(&db).await?;
    assert_mapped(&orm)?;
    Ok(())
}

#[tokio::test]
async fn test_construct_and_bind_in_one_call() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;

    let orm = Orm::builder().skeletons(skeletons()).database(&db).await?;
    assert_mapped(&orm)?;
    Ok(())
}

#[tokio::test]
async fn test_unmapped_tables_are_kept() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;
    let orm = Orm::builder().skeletons(skeletons()).database(&db).await?;

    let binding = orm.binding().ok_or("not bound")?;
    let unmapped: Vec<&str> = binding.unmapped_tables().map(|t| t.name.as_str()).collect();
    assert_eq!(unmapped, ["audit_log"]);
    assert!(binding.metadata().table("audit_log").is_some_and(|t| t.has_column("message")));

    assert_eq!(orm.mapped_for_table("addresses")?.map(|m| m.name().to_string()), Some("Address".to_string()));
    assert!(orm.mapped_for_table("audit_log")?.is_none());
    assert!(matches!(orm.mapped("AuditLog"), Err(Error::UnknownClass(_))));
    Ok(())
}

#[tokio::test]
async fn test_persist_and_load_through_relationships() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;
    let mut orm = Orm::builder().skeletons(skeletons()).database(&db).await?;
    let users = orm.mapped("User")?;
    let addresses = orm.mapped("Address")?;

    let ed = orm.new_object("User", fields! { "name" => "ed", "fullname" => "Ed Jones" })?;
    let home = orm.new_object("Address", fields! { "email" => "ed@home" })?;
    let work = orm.new_object("Address", fields! { "email" => "ed@work" })?;
    ed.set("addresses", vec![home.clone(), work.clone()])?;
    assert_eq!(home.related("user")?, Some(vec![ed.clone()]));

    let session = orm.session()?;
    session.add(&ed)?;
    assert_eq!(session.pending().len(), 3);
    session.commit().await?;

    assert_eq!(ed.state(), ObjectState::Persistent);
    let id = ed.get("id")?;
    assert!(id.as_i64().is_some());
    assert_eq!(home.get("user_id")?, id);
    assert_eq!(work.get("user_id")?, id);

    // the identity map hands back the same objects
    let found = session.find(&addresses, &fields! { "email" => "ed@work" }).await?;
    assert_eq!(found, vec![work.clone()]);
    let loaded = session.related(&ed, "addresses").await?;
    assert_eq!(loaded.len(), 2);
    assert!(loaded.contains(&home) && loaded.contains(&work));
    session.commit().await?;

    let mut other = orm.create_session()?;
    let copy = other.get(&users, id.clone()).await?.ok_or("user not found")?;
    assert_ne!(copy, ed);
    assert_eq!(copy.get("fullname")?, "Ed Jones");
    let copies = other.related(&copy, "addresses").await?;
    assert_eq!(copies.len(), 2);
    assert_eq!(other.related(&copies[0], "user").await?, vec![copy.clone()]);
    other.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_relationships_declared_on_both_sides() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;
    let orm = Orm::builder()
        .class("User", ClassSkeleton::new("users").relationship("addresses", RelationshipDecl::new("Address")))
        .class("Address", ClassSkeleton::new("addresses").relationship("user", RelationshipDecl::new("User")))
        .database(&db)
        .await?;
    let users = orm.mapped("User")?;
    let addresses = orm.mapped("Address")?;
    assert!(users.relationship("addresses").is_some_and(|r| r.kind.is_collection()));
    assert!(addresses.relationship("user").is_some_and(|r| !r.kind.is_collection()));

    let mut session = orm.create_session()?;
    let user = users.instantiate(fields! { "name" => "ed" })?;
    let address = addresses.instantiate(fields! { "email" => "ed@example.com", "user" => &user })?;
    session.add(&address)?;
    session.commit().await?;

    assert_eq!(user.state(), ObjectState::Persistent);
    assert_eq!(address.get("user_id")?, user.get("id")?);
    assert!(session.related(&user, "addresses").await?.contains(&address));
    assert_eq!(session.related(&address, "user").await?, vec![user.clone()]);
    session.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_moving_and_deleting_children() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;
    let orm = Orm::builder().skeletons(skeletons()).database(&db).await?;
    let users = orm.mapped("User")?;
    let addresses = orm.mapped("Address")?;

    let mut session = orm.create_session()?;
    let ed = users.instantiate(fields! { "name" => "ed" })?;
    let wendy = users.instantiate(fields! { "name" => "wendy" })?;
    let address = addresses.instantiate(fields! { "email" => "shared@example.com" })?;
    address.set("user", &ed)?;
    session.add_all([&ed, &wendy])?;
    session.commit().await?;
    assert_eq!(address.get("user_id")?, ed.get("id")?);

    // reassigning the parent moves the child between collections
    wendy.append("addresses", &address)?;
    assert_eq!(address.related("user")?, Some(vec![wendy.clone()]));
    session.commit().await?;
    assert_eq!(address.get("user_id")?, wendy.get("id")?);
    assert!(session.related(&ed, "addresses").await?.is_empty());

    // deleting a parent unlinks its children
    session.delete(&wendy)?;
    session.commit().await?;
    assert_eq!(wendy.state(), ObjectState::Deleted);
    assert_eq!(address.get("user_id")?, Value::Null);
    assert_eq!(session.count(&users, &fields! {}).await?, 1);
    assert_eq!(session.count(&addresses, &fields! { "user_id" => Value::Null }).await?, 1);

    // deleting a pending object only forgets it
    let draft = addresses.instantiate(fields! { "email" => "draft@example.com" })?;
    session.add(&draft)?;
    session.delete(&draft)?;
    assert_eq!(draft.state(), ObjectState::Transient);
    session.commit().await?;
    assert_eq!(session.count(&addresses, &fields! {}).await?, 1);
    session.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_rollback_restores_objects() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;
    let orm = Orm::builder().skeletons(skeletons()).database(&db).await?;
    let users = orm.mapped("User")?;

    let mut session = orm.create_session()?;
    let ed = users.instantiate(fields! { "name" => "ed" })?;
    session.add(&ed)?;
    session.commit().await?;

    ed.set("name", "edward")?;
    let temp = users.instantiate(fields! { "name" => "temp" })?;
    session.add(&temp)?;
    session.flush().await?;
    assert_eq!(temp.state(), ObjectState::Persistent);

    session.rollback().await?;
    assert_eq!(temp.state(), ObjectState::Transient);
    assert_eq!(temp.identity(), None);
    assert_eq!(ed.get("name")?, "ed");
    assert!(!ed.is_modified());
    assert_eq!(session.count(&users, &fields! {}).await?, 1);
    session.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_schema_mismatch() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;

    let mut orm = Orm::new();
    orm.register("Ghost", ClassSkeleton::new("ghosts"));
    let err = orm.bind(&db).await.unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch { ref table, .. } if table == "ghosts"));
    assert!(!orm.is_bound());

    let mut orm = Orm::new();
    orm.register("User", ClassSkeleton::new("users").field("nickname", FieldDecl::untyped()));
    let err = orm.bind(&db).await.unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch { ref detail, .. } if detail.contains("nickname")));
    Ok(())
}

#[tokio::test]
async fn test_duplicate_table() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;

    let mut orm = Orm::new();
    orm.register("User", ClassSkeleton::new("users")).register("Member", ClassSkeleton::new("users"));
    let err = orm.bind(&db).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateTable { ref table, .. } if table == "users"));
    Ok(())
}

#[tokio::test]
async fn test_rebinding_invalidates_sessions() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;
    let mut orm = Orm::builder().skeletons(skeletons()).database(&db).await?;
    let old_users = orm.mapped("User")?;
    let mut old_session = orm.create_session()?;

    // a class registered after binding is not bound yet
    orm.register("AuditLog", ClassSkeleton::new("audit_log"));
    assert!(matches!(orm.mapped("AuditLog"), Err(Error::NotBound)));

    orm.bind(&db).await?;
    assert_eq!(orm.generation(), 2);
    assert_eq!(orm.mapped("AuditLog")?.table_name(), "audit_log");

    let err = old_session.all(&old_users).await.unwrap_err();
    assert!(matches!(err, Error::StaleBinding { expected: 1, current: 2 }));

    let err = orm.session()?.all(&old_users).await.unwrap_err();
    assert!(matches!(err, Error::StaleBinding { expected: 1, current: 2 }));

    let users = orm.mapped("User")?;
    assert!(orm.session()?.all(&users).await?.is_empty());
    orm.reset_session().await?;
    old_session.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_bind_keeps_binding_and_session() -> Result<(), Box<dyn std::error::Error>> {
    let db = user_database().await?;
    let mut orm = Orm::builder().skeletons(skeletons()).database(&db).await?;
    let users = orm.mapped("User")?;

    let ed = users.instantiate(fields! { "name" => "ed" })?;
    let wendy = users.instantiate(fields! { "name" => "wendy" })?;
    let session = orm.session()?;
    session.add(&ed)?;
    session.flush().await?;
    session.add(&wendy)?;

    let err = orm.bind("nosuchdriver://localhost/app").await.unwrap_err();
    assert!(matches!(err, Error::Connection { ref target, .. } if target == "nosuchdriver://localhost/app"));
    assert!(orm.is_bound());
    assert_eq!(orm.generation(), 1);

    // flushed and pending work of the default session survive
    let session = orm.session()?;
    assert!(session.in_transaction());
    assert_eq!(session.pending().len(), 1);
    session.commit().await?;
    assert_eq!(ed.state(), ObjectState::Persistent);
    assert_eq!(wendy.state(), ObjectState::Persistent);
    assert_eq!(session.count(&users, &fields! {}).await?, 2);
    session.commit().await?;

    let mut orm = Orm::new();
    assert!(matches!(orm.connect("nosuchdriver://localhost/app").await, Err(Error::Connection { .. })));
    assert!(!orm.is_bound());
    Ok(())
}

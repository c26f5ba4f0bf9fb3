use reflect_orm::{
    ClassSkeleton, Database, Error, Object, ObjectState, Orm, RelationshipDecl, SessionOptions, Value, fields, update_object,
};

async fn setup() -> Result<Orm, Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let db = Database::builder().max_connections(1).connect("sqlite::memory:").await?;
    db.raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, fullname TEXT, age INTEGER)").execute().await?;
    db.raw("CREATE TABLE addresses (id INTEGER PRIMARY KEY, email TEXT, user_id INTEGER REFERENCES users (id))")
        .execute()
        .await?;
    db.raw("INSERT INTO users (name, fullname) VALUES ('bob', 'Bob One'), ('bob', 'Bob Two')").execute().await?;

    let orm = Orm::builder()
        .class(
            "User",
            ClassSkeleton::new("users").relationship("addresses", RelationshipDecl::new("Address").backref("user")),
        )
        .class("Address", ClassSkeleton::new("addresses"))
        .database(&db)
        .await?;
    Ok(orm)
}

#[tokio::test]
async fn test_get_or_create_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let mut orm = setup().await?;

    let alice = orm.get_or_create("User", fields! { "name" => "alice" }).await?;
    assert_eq!(alice.state(), ObjectState::Pending);
    assert_eq!(alice.get("name")?, "alice");

    // the pending object is flushed before counting, then found again
    let again = orm.get_or_create("User", fields! { "name" => "alice" }).await?;
    assert_eq!(again, alice);
    assert_eq!(alice.state(), ObjectState::Persistent);

    let users = orm.mapped("User")?;
    assert_eq!(orm.session()?.count(&users, &fields! { "name" => "alice" }).await?, 1);
    orm.session()?.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_get_or_create_with_null_predicate() -> Result<(), Box<dyn std::error::Error>> {
    let mut orm = setup().await?;

    let carol = orm.get_or_create("User", fields! { "name" => "carol", "fullname" => Value::Null }).await?;
    orm.session()?.commit().await?;
    let again = orm.get_or_create("User", fields! { "name" => "carol", "fullname" => None::<String> }).await?;
    assert_eq!(again, carol);

    let other = orm.get_or_create("User", fields! { "name" => "carol", "fullname" => "Carol C" }).await?;
    assert_ne!(other, carol);
    orm.session()?.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_get_or_create_rejects_ambiguous_predicates() -> Result<(), Box<dyn std::error::Error>> {
    let mut orm = setup().await?;

    let err = orm.get_or_create("User", fields! { "name" => "bob" }).await.unwrap_err();
    assert!(matches!(err, Error::NonUniqueResult { ref class, count: 2 } if class == "User"));

    let bob = orm.get_or_create("User", fields! { "name" => "bob", "fullname" => "Bob Two" }).await?;
    assert_eq!(bob.state(), ObjectState::Persistent);

    let err = orm.get_or_create("User", fields! { "nickname" => "bobby" }).await.unwrap_err();
    assert!(matches!(err, Error::UnknownAttribute { ref attribute, .. } if attribute == "nickname"));

    assert!(matches!(orm.get_or_create("Group", fields! {}).await, Err(Error::UnknownClass(_))));
    orm.session()?.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_get_or_create_without_autoflush() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = Database::connect("sqlite::memory:").await?;
    db.raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)").execute().await?;
    let orm = Orm::builder()
        .class("User", ClassSkeleton::new("users"))
        .session_options(SessionOptions::default().autoflush(false))
        .database(&db)
        .await?;
    let users = orm.mapped("User")?;

    let mut session = orm.create_session()?;
    let first = session.get_or_create(&users, fields! { "name" => "dan" }).await?;
    let second = session.get_or_create(&users, fields! { "name" => "dan" }).await?;
    assert_ne!(first, second);
    assert_eq!(session.pending().len(), 2);
    session.rollback().await?;
    assert_eq!(first.state(), ObjectState::Transient);
    Ok(())
}

#[tokio::test]
async fn test_update_object_is_all_or_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut orm = setup().await?;
    let alice = orm.get_or_create("User", fields! { "name" => "alice" }).await?;

    let err = orm.update_object(&alice, fields! { "fullname" => "Alice A", "nickname" => "al" }).unwrap_err();
    assert!(matches!(err, Error::UnknownAttribute { ref class, ref attribute } if class == "User" && attribute == "nickname"));
    assert_eq!(alice.get("fullname")?, Value::Null);

    let err = orm.update_object(&alice, fields! { "age" => 30, "addresses" => "nowhere" }).unwrap_err();
    assert!(matches!(err, Error::AttributeType { ref attribute, .. } if attribute == "addresses"));
    assert_eq!(alice.get("age")?, Value::Null);

    let home = orm.new_object("Address", fields! { "email" => "alice@home" })?;
    orm.update_object(&alice, fields! { "fullname" => "Alice A", "age" => 30, "addresses" => vec![home.clone()] })?;
    assert_eq!(alice.get("fullname")?, "Alice A");
    assert_eq!(home.related("user")?, Some(vec![alice.clone()]));

    orm.session()?.commit().await?;
    assert_eq!(home.get("user_id")?, alice.get("id")?);
    assert_eq!(alice.get("age")?, Value::Integer(30));

    // persistent collections must be loaded before they are replaced
    let err = update_object(&alice, fields! { "addresses" => Vec::<Object>::new() }).unwrap_err();
    assert!(matches!(err, Error::AttributeType { .. }));
    Ok(())
}

#[tokio::test]
async fn test_get_or_create_and_update() -> Result<(), Box<dyn std::error::Error>> {
    let mut orm = setup().await?;

    let dave = orm.get_or_create_and_update("User", fields! { "name" => "dave" }, fields! { "age" => 40 }).await?;
    assert_eq!(dave.state(), ObjectState::Pending);
    orm.session()?.commit().await?;

    let same = orm.get_or_create_and_update("User", fields! { "name" => "dave" }, fields! { "age" => 41 }).await?;
    assert_eq!(same, dave);
    assert!(dave.is_modified());
    orm.session()?.commit().await?;

    let users = orm.mapped("User")?;
    let mut session = orm.create_session()?;
    let found = session.find(&users, &fields! { "name" => "dave" }).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("age")?, Value::Integer(41));
    session.close().await?;

    // failures propagate without touching the object
    let err = orm
        .get_or_create_and_update("User", fields! { "name" => "dave" }, fields! { "height" => 180 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownAttribute { .. }));
    assert!(!dave.is_modified());
    orm.reset_session().await?;
    Ok(())
}

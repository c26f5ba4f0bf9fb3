use reflect_orm::{
    ClassSkeleton, ColumnType, Declarations, Error, FieldDecl, ObjectState, Orm, Skeleton, TableDecl, Value, fields,
};

#[allow(dead_code)]
#[derive(Skeleton)]
#[orm(table = "users")]
struct User {
    #[orm(primary_key)]
    id: i64,
    name: String,
    fullname: Option<String>,
    #[orm(relationship = "Address", backref = "user")]
    addresses: Vec<Address>,
}

#[allow(dead_code)]
#[derive(Skeleton)]
#[orm(table = "addresses")]
struct Address {
    #[orm(primary_key)]
    id: i64,
    #[orm(index)]
    email: String,
    #[orm(foreign_key = "users.id")]
    user_id: Option<i64>,
}

#[allow(dead_code)]
#[derive(Skeleton)]
#[orm(table = "things", class = "Thing")]
struct ThingDecl {
    #[orm(primary_key)]
    id: i64,
    #[orm(column = "label")]
    name: String,
    #[orm(
        relationship = "Thing",
        secondary = "things_association",
        primary_join = "Thing.id==things_association.c.parent_id",
        secondary_join = "Thing.id==things_association.c.child_id",
        backref = "parents"
    )]
    children: Vec<ThingDecl>,
    #[orm(skip)]
    scratch: Vec<u8>,
}

const DECLARATIONS: &str = r#"{
    "User": {
        "table": "users",
        "attributes": {
            "id": { "kind": "field", "type": "big_int", "primary_key": true },
            "name": { "kind": "field", "type": "text", "nullable": false },
            "fullname": { "kind": "field", "type": "text", "nullable": true },
            "addresses": { "kind": "relationship", "target": "Address", "backref": "user" }
        }
    },
    "Address": {
        "table": "addresses",
        "attributes": {
            "id": { "kind": "field", "type": "big_int", "primary_key": true },
            "email": { "kind": "field", "type": "text", "nullable": false, "index": true },
            "user_id": { "kind": "field", "type": "big_int", "nullable": true, "foreign_key": "users.id" }
        }
    }
}"#;

fn association_table() -> TableDecl {
    TableDecl::new("things_association")
        .column("parent_id", FieldDecl::untyped().primary_key().foreign_key("things.id"))
        .column("child_id", FieldDecl::untyped().primary_key().foreign_key("things.id"))
}

#[test]
fn test_derive_matches_json_declarations() -> Result<(), Box<dyn std::error::Error>> {
    let declarations = Declarations::from_json(DECLARATIONS)?;
    assert_eq!(declarations.0["User"], User::skeleton());
    assert_eq!(declarations.0["Address"], Address::skeleton());
    assert_eq!(User::class_name(), "User");

    let round_trip = Declarations::from_json(&declarations.to_json()?)?;
    assert_eq!(round_trip, declarations);

    let thing = ThingDecl::skeleton();
    assert_eq!(ThingDecl::class_name(), "Thing");
    assert_eq!(thing.table, "things");
    assert!(!thing.attributes.contains_key("scratch"));
    assert_eq!(thing.fields().find(|(n, _)| *n == "name").and_then(|(_, f)| f.column.as_deref()), Some("label"));
    Ok(())
}

#[tokio::test]
async fn test_eager_binding_from_url() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut orm = Orm::builder()
        .declare::<User>()
        .declare::<Address>()
        .deferred_reflection(false)
        .connect("sqlite::memory:")
        .await?;

    let db = orm.database()?.clone();
    assert!(db.table_exists("users").await?);
    assert!(db.table_exists("addresses").await?);
    let users = orm.mapped("User")?;
    assert!(users.table().column("fullname").is_some_and(|c| c.nullable));
    assert!(orm.mapped("Address")?.relationship("user").is_some());

    let ed = orm.new_object("User", fields! { "name" => "ed" })?;
    let address = orm.new_object("Address", fields! { "email" => "ed@example.com", "user" => &ed })?;
    let session = orm.session()?;
    session.add(&address)?;
    session.commit().await?;
    assert_eq!(ed.state(), ObjectState::Persistent);
    assert_eq!(address.get("user_id")?, ed.get("id")?);
    assert_eq!(session.count(&users, &fields! {}).await?, 1);
    session.commit().await?;

    let rows = db.raw("SELECT email FROM addresses WHERE user_id = ?").bind(ed.get("id")?).fetch_values().await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], "ed@example.com");
    Ok(())
}

#[tokio::test]
async fn test_eager_binding_follows_rust_nullability() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let orm = Orm::builder()
        .declare::<User>()
        .declare::<Address>()
        .deferred_reflection(false)
        .connect("sqlite::memory:")
        .await?;
    let addresses = orm.mapped("Address")?;
    assert!(addresses.table().column("email").is_some_and(|c| !c.nullable));
    assert!(addresses.table().column("user_id").is_some_and(|c| c.nullable));

    let db = orm.database()?.clone();
    assert!(db.raw("INSERT INTO addresses (email) VALUES (NULL)").execute().await.is_err());
    db.raw("INSERT INTO addresses (email) VALUES ('nobody@example.com')").execute().await?;
    Ok(())
}

#[tokio::test]
async fn test_eager_binding_rejects_untyped_columns() -> Result<(), Box<dyn std::error::Error>> {
    let note = ClassSkeleton::new("notes")
        .field("id", FieldDecl::new(ColumnType::Integer).primary_key())
        .field("body", FieldDecl::untyped());
    let result = Orm::builder().class("Note", note).deferred_reflection(false).connect("sqlite::memory:").await;
    assert!(matches!(result, Err(Error::InvalidDeclaration { ref class, .. }) if class == "Note"));
    Ok(())
}

#[tokio::test]
async fn test_self_referential_many_to_many() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut orm = Orm::builder()
        .declare::<ThingDecl>()
        .table(association_table())
        .deferred_reflection(false)
        .connect("sqlite::memory:")
        .await?;
    let things = orm.mapped("Thing")?;
    assert!(things.relationship("parents").is_some());
    let binding = orm.binding().ok_or("not bound")?;
    assert_eq!(binding.unmapped_tables().map(|t| t.name.as_str()).collect::<Vec<_>>(), ["things_association"]);

    let parent = orm.new_object("Thing", fields! { "name" => "Rumplestiltskin" })?;
    let first = orm.new_object("Thing", fields! { "name" => "Hansel" })?;
    let second = orm.new_object("Thing", fields! { "name" => "Gretel" })?;
    parent.append("children", &first)?;
    second.append("parents", &parent)?;
    assert_eq!(parent.related("children")?, Some(vec![first.clone(), second.clone()]));
    assert_eq!(first.related("parents")?, Some(vec![parent.clone()]));
    assert_eq!(parent.to_string(), r#"<Thing: {"label":"Rumplestiltskin"}>"#);

    let session = orm.session()?;
    session.add(&parent)?;
    session.commit().await?;
    orm.reset_session().await?;

    // a fresh session reads the links back from the association table
    let mut session = orm.create_session()?;
    let parent_id = parent.get("id")?;
    let loaded = session.get(&things, parent_id).await?.ok_or("parent not found")?;
    let children = session.related(&loaded, "children").await?;
    let mut names: Vec<String> = children
        .iter()
        .map(|c| c.get("name").map(|v| v.as_str().unwrap_or_default().to_string()))
        .collect::<Result<_, _>>()?;
    names.sort();
    assert_eq!(names, ["Gretel", "Hansel"]);

    let hansel = children.iter().find(|c| c.get("name").is_ok_and(|v| v == "Hansel")).ok_or("no hansel")?.clone();
    assert_eq!(session.related(&hansel, "parents").await?, vec![loaded.clone()]);

    // unlinking removes the association row only
    loaded.remove("children", &hansel)?;
    session.commit().await?;
    assert_eq!(session.related(&loaded, "children").await?.len(), 1);
    assert!(session.related(&hansel, "parents").await?.is_empty());
    assert_eq!(session.count(&things, &fields! {}).await?, 3);
    session.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_flush_keeps_relationship_changes() -> Result<(), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let orm = Orm::builder()
        .declare::<ThingDecl>()
        .table(association_table())
        .deferred_reflection(false)
        .connect("sqlite::memory:")
        .await?;
    let things = orm.mapped("Thing")?;

    let mut session = orm.create_session()?;
    let parent = things.instantiate(fields! { "name" => "Geppetto" })?;
    let child = things.instantiate(fields! { "name" => "Pinocchio" })?;
    session.add_all([&parent, &child])?;
    session.commit().await?;

    // the insert violates NOT NULL before the association row is written
    parent.append("children", &child)?;
    let draft = things.instantiate(fields! { "name" => Value::Null })?;
    session.add(&draft)?;
    assert!(session.flush().await.is_err());
    assert_eq!(session.pending().len(), 1);
    assert!(parent.is_modified() || child.is_modified());

    draft.set("name", "Figaro")?;
    session.commit().await?;
    assert_eq!(draft.state(), ObjectState::Persistent);
    assert!(!parent.is_modified() && !child.is_modified());
    session.close().await?;

    let mut session = orm.create_session()?;
    let loaded = session.get(&things, parent.get("id")?).await?.ok_or("parent not found")?;
    let children = session.related(&loaded, "children").await?;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].get("name")?, "Pinocchio");
    session.close().await?;
    Ok(())
}

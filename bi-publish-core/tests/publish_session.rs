use std::io::Write;
use std::path::Path;

use bi_publish_core::contract::{
    AuthToken, DocumentUpload, Folder, MockConnectionResolver, MockServerApi, PublishedDocument,
    RemoteConnection, ResolveError, TargetConnection,
};
use bi_publish_core::document::DocumentKind;
use bi_publish_core::error::{PostUploadStep, PublishError};
use bi_publish_core::session::{ExtractOutcome, PublishSession};
use tempfile::tempdir;
use zip::write::SimpleFileOptions;

const DATASOURCE: &str = r#"<?xml version='1.0' encoding='utf-8' ?>
<datasource formatted-name='federated.1' inline='true' version='18.1'>
  <connection class='federated'>
    <named-connections>
      <named-connection caption='Warehouse' name='postgres.1x'>
        <connection class='postgres' dbname='sales' port='5432' schema='public' server='db1' username='svc' />
      </named-connection>
    </named-connections>
    <relation connection='postgres.1x' name='orders' table='[public].[orders]' type='table' />
  </connection>
</datasource>
"#;

const WORKBOOK: &str = r#"<?xml version='1.0' encoding='utf-8' ?>
<workbook version='18.1'>
  <datasources>
    <datasource name='federated.1'>
      <connection class='federated'>
        <named-connections>
          <named-connection caption='Prod' name='postgres.0a'>
            <connection class='postgres' dbname='sales' port='5432' schema='dev' server='dev-db' username='dev' />
          </named-connection>
        </named-connections>
        <relation connection='postgres.0a' name='orders' table='[dev].[orders]' type='table' />
      </connection>
    </datasource>
  </datasources>
</workbook>
"#;

const WORKBOOK_WITH_DEV: &str = r#"<workbook>
  <named-connections>
    <named-connection caption='Prod' name='postgres.0a'>
      <connection class='postgres' port='5432' server='dev-db' username='dev' />
    </named-connection>
    <named-connection caption='Dev' name='postgres.0b'>
      <connection class='postgres' port='5432' server='dev-db2' username='dev2' />
    </named-connection>
  </named-connections>
</workbook>
"#;

fn token() -> AuthToken {
    AuthToken {
        token: "tok".to_string(),
        site_id: "site-1".to_string(),
    }
}

/// Api mock that signs in and owns the top-level "Finance" folder.
fn api_with_folder() -> MockServerApi {
    let mut api = MockServerApi::new();
    api.expect_sign_in().returning(|_| Ok(token()));
    api.expect_list_folders().returning(|_| {
        Ok(vec![Folder {
            id: "f-1".to_string(),
            name: "Finance".to_string(),
            parent_project_id: None,
        }])
    });
    api
}

fn warehouse_connection() -> RemoteConnection {
    RemoteConnection {
        id: "c-1".to_string(),
        connection_type: "postgres".to_string(),
        server_address: "db1".to_string(),
        server_port: "5432".to_string(),
        user_name: "svc".to_string(),
    }
}

fn prod_target() -> TargetConnection {
    TargetConnection {
        server_address: "prod-db".to_string(),
        server_port: "5432".to_string(),
        user_name: "svc_prod".to_string(),
        password: "s3cret".to_string(),
        schema: "prod".to_string(),
        ..Default::default()
    }
}

fn published(id: &str, upload: &DocumentUpload) -> PublishedDocument {
    PublishedDocument {
        id: id.to_string(),
        name: upload
            .file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        project_id: Some("f-1".to_string()),
        ..Default::default()
    }
}

fn write_zip(path: &Path, members: &[(&str, &str)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, content) in members {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

async fn signed_in(api: MockServerApi) -> PublishSession<MockServerApi> {
    let mut session = PublishSession::new(api);
    session.sign_in("publisher", "pw", "marketing").await.unwrap();
    session
}

#[tokio::test]
async fn datasource_publish_binds_each_remote_connection_once() {
    let tmp = tempdir().unwrap();
    let doc = tmp.path().join("sales.tds");
    std::fs::write(&doc, DATASOURCE).unwrap();

    let mut api = api_with_folder();
    api.expect_upload_document()
        .withf(|_, upload: &DocumentUpload| {
            upload.kind == DocumentKind::DataSource
                && upload.metadata_xml
                    == r#"<tsRequest><datasource name="sales"><project id="f-1"/></datasource></tsRequest>"#
        })
        .times(1)
        .returning(|_, upload| Ok(published("ds-1", &upload)));
    api.expect_list_datasource_connections()
        .withf(|_, id| id == "ds-1")
        .times(1)
        .returning(|_, _| Ok(vec![warehouse_connection()]));
    api.expect_update_datasource_connection()
        .withf(|_, ds, conn, target: &TargetConnection| {
            ds == "ds-1" && conn == "c-1" && target.server_address == "prod-db"
        })
        .times(1)
        .returning(|_, _, _, _| Ok(()));

    let mut resolver = MockConnectionResolver::new();
    resolver
        .expect_resolve()
        .withf(|caption| caption == "Warehouse")
        .times(1)
        .returning(|_| Ok(prod_target()));

    let session = signed_in(api).await;
    let report = session.publish(&doc, "Finance", &resolver).await.unwrap();

    assert_eq!(report.document.id, "ds-1");
    assert_eq!(report.folder_id, "f-1");
    assert_eq!(report.connections_bound, 1);
    assert_eq!(report.extract, ExtractOutcome::NotRequested);
}

#[tokio::test]
async fn failed_bind_is_partial_publish_with_document_id() {
    let tmp = tempdir().unwrap();
    let doc = tmp.path().join("sales.tds");
    std::fs::write(&doc, DATASOURCE).unwrap();

    let mut api = api_with_folder();
    api.expect_upload_document()
        .returning(|_, upload| Ok(published("ds-2", &upload)));
    api.expect_list_datasource_connections()
        .returning(|_, _| Ok(vec![warehouse_connection()]));
    api.expect_update_datasource_connection()
        .times(1)
        .returning(|_, _, _, _| {
            Err(PublishError::RemoteApi {
                uri: "connections/c-1".to_string(),
                status: 400,
                body: "<error code='400'/>".to_string(),
            })
        });

    let mut resolver = MockConnectionResolver::new();
    resolver.expect_resolve().returning(|_| Ok(prod_target()));

    let session = signed_in(api).await;
    let err = session.publish(&doc, "Finance", &resolver).await.unwrap_err();

    assert!(err.is_partial());
    assert_eq!(err.published_document_id(), Some("ds-2"));
    assert!(matches!(
        err,
        PublishError::PartialPublish {
            step: PostUploadStep::CredentialBind,
            ..
        }
    ));
}

#[tokio::test]
async fn remote_key_missing_from_document_is_resolution_failure() {
    let tmp = tempdir().unwrap();
    let doc = tmp.path().join("sales.tds");
    std::fs::write(&doc, DATASOURCE).unwrap();

    let mut api = api_with_folder();
    api.expect_upload_document()
        .returning(|_, upload| Ok(published("ds-3", &upload)));
    api.expect_list_datasource_connections().returning(|_, _| {
        Ok(vec![RemoteConnection {
            user_name: "someone-else".to_string(),
            ..warehouse_connection()
        }])
    });

    let resolver = MockConnectionResolver::new();
    let session = signed_in(api).await;
    let err = session.publish(&doc, "Finance", &resolver).await.unwrap_err();

    match err {
        PublishError::PartialPublish {
            document_id,
            source,
            ..
        } => {
            assert_eq!(document_id, "ds-3");
            assert!(
                matches!(*source, PublishError::Resolution { ref identity, .. } if identity == "postgres|db1|5432|someone-else")
            );
        }
        other => panic!("expected partial publish, got {other:?}"),
    }
}

#[tokio::test]
async fn bundle_datasource_refreshes_extract_per_side_file() {
    let tmp = tempdir().unwrap();
    let doc = tmp.path().join("sales.tdsx");
    write_zip(&doc, &[("sales.tds", DATASOURCE), ("Data/extract.hyper", "hyper")]);
    std::fs::write(
        tmp.path().join("sales.tdsx.json"),
        r#"{"ExtractDataSourceData":true,"EncryptData":true}"#,
    )
    .unwrap();

    let expected_path = doc.clone();
    let mut api = api_with_folder();
    api.expect_upload_document()
        .withf(move |_, upload: &DocumentUpload| {
            upload.kind == DocumentKind::DataSourceBundle && upload.file_path == expected_path
        })
        .returning(|_, upload| Ok(published("ds-4", &upload)));
    api.expect_list_datasource_connections()
        .returning(|_, _| Ok(vec![warehouse_connection()]));
    api.expect_update_datasource_connection()
        .times(1)
        .returning(|_, _, _, _| Ok(()));
    api.expect_delete_extract()
        .times(1)
        .returning(|_, _| Ok(()));
    api.expect_create_extract()
        .withf(|_, id, encrypt| id == "ds-4" && *encrypt)
        .times(1)
        .returning(|_, _, _| Ok(()));

    let mut resolver = MockConnectionResolver::new();
    resolver.expect_resolve().returning(|_| Ok(prod_target()));

    let session = signed_in(api).await;
    let report = session.publish(&doc, "Finance", &resolver).await.unwrap();
    assert_eq!(report.extract, ExtractOutcome::Refreshed { encrypted: true });
}

#[tokio::test]
async fn workbook_upload_carries_rewritten_copy_and_credentials() {
    let tmp = tempdir().unwrap();
    let doc = tmp.path().join("Sales Overview.twb");
    std::fs::write(&doc, WORKBOOK).unwrap();

    let mut api = api_with_folder();
    api.expect_upload_document()
        .times(1)
        .returning(|_, upload: DocumentUpload| {
            // The staging copy exists for the duration of the upload.
            let uploaded = std::fs::read_to_string(&upload.file_path).unwrap();
            assert!(uploaded.contains("server='prod-db'"));
            assert!(uploaded.contains("username='svc_prod'"));
            assert!(uploaded.contains("schema='prod'"));
            assert!(uploaded.contains("table='[prod].[orders]'"));
            assert_eq!(
                upload.file_path.file_name().unwrap().to_string_lossy(),
                "Sales Overview.twb"
            );
            assert!(upload.metadata_xml.starts_with(
                r#"<tsRequest><workbook name="Sales Overview" showTabs="true"><connections><connection serverAddress="prod-db"><connectionCredentials name="svc_prod" password="s3cret" embed="true" />"#
            ));
            assert!(upload.metadata_xml.ends_with(r#"<project id="f-1"/></workbook></tsRequest>"#));
            Ok(published("wb-1", &upload))
        });

    let mut resolver = MockConnectionResolver::new();
    resolver
        .expect_resolve()
        .withf(|caption| caption == "Prod")
        .returning(|_| Ok(prod_target()));

    let session = signed_in(api).await;
    let report = session.publish(&doc, "Finance", &resolver).await.unwrap();

    assert_eq!(report.document.id, "wb-1");
    assert_eq!(report.connections_bound, 0);
    // Source document untouched.
    assert_eq!(std::fs::read_to_string(&doc).unwrap(), WORKBOOK);
}

#[tokio::test]
async fn unresolvable_caption_aborts_before_any_network_call() {
    let tmp = tempdir().unwrap();
    let doc = tmp.path().join("book.twb");
    std::fs::write(&doc, WORKBOOK_WITH_DEV).unwrap();

    // Only sign-in is expected: listing folders or uploading would panic.
    let mut api = MockServerApi::new();
    api.expect_sign_in().returning(|_| Ok(token()));

    let mut resolver = MockConnectionResolver::new();
    resolver.expect_resolve().returning(|caption| match caption {
        "Prod" => Ok(TargetConnection {
            server_address: "db1".to_string(),
            user_name: "svc".to_string(),
            ..Default::default()
        }),
        other => Err(ResolveError::NotFound(other.to_string())),
    });

    let session = signed_in(api).await;
    let err = session.publish(&doc, "Finance", &resolver).await.unwrap_err();
    assert!(matches!(err, PublishError::Resolution { ref identity, .. } if identity == "Dev"));
}

#[tokio::test]
async fn workbook_bundle_uploads_original_bytes_with_all_member_credentials() {
    let tmp = tempdir().unwrap();
    let doc = tmp.path().join("pack.twbx");
    write_zip(
        &doc,
        &[("pack.twb", WORKBOOK), ("nested/other.twb", WORKBOOK), ("img.png", "png")],
    );
    let original = std::fs::read(&doc).unwrap();

    let expected_path = doc.clone();
    let mut api = api_with_folder();
    api.expect_upload_document()
        .withf(move |_, upload: &DocumentUpload| {
            upload.kind == DocumentKind::WorkbookBundle
                && upload.file_path == expected_path
                && upload.metadata_xml.matches("<connectionCredentials").count() == 2
        })
        .times(1)
        .returning(|_, upload| Ok(published("wb-2", &upload)));

    let mut resolver = MockConnectionResolver::new();
    resolver.expect_resolve().returning(|_| Ok(prod_target()));

    let session = signed_in(api).await;
    session.publish(&doc, "Finance", &resolver).await.unwrap();
    assert_eq!(std::fs::read(&doc).unwrap(), original);
}

#[tokio::test]
async fn second_sign_out_fails_with_not_signed_in() {
    let mut api = MockServerApi::new();
    api.expect_sign_in().returning(|_| Ok(token()));
    api.expect_sign_out().times(1).returning(|_| Ok(()));

    let mut session = PublishSession::new(api);
    session.sign_in("publisher", "pw", "").await.unwrap();
    session.sign_out().await.unwrap();
    assert!(!session.is_signed_in());
    assert!(matches!(
        session.sign_out().await,
        Err(PublishError::NotSignedIn)
    ));
}

#[tokio::test]
async fn rejected_sign_in_leaves_session_empty() {
    let mut api = MockServerApi::new();
    api.expect_sign_in()
        .returning(|_| Err(PublishError::Auth("bad credentials".to_string())));

    let mut session = PublishSession::new(api);
    let err = session.sign_in("publisher", "wrong", "").await.unwrap_err();
    assert!(matches!(err, PublishError::Auth(_)));
    assert!(!session.is_signed_in());
}

#[cfg(unix)]
#[tokio::test]
async fn workbook_bundle_with_read_only_member_publishes() {
    let tmp = tempdir().unwrap();
    let doc = tmp.path().join("locked.twbx");
    let file = std::fs::File::create(&doc).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    zip.start_file("locked.twb", SimpleFileOptions::default().unix_permissions(0o444))
        .unwrap();
    zip.write_all(WORKBOOK.as_bytes()).unwrap();
    zip.finish().unwrap();

    let mut api = api_with_folder();
    api.expect_upload_document()
        .withf(|_, upload: &DocumentUpload| {
            upload.metadata_xml.matches("<connectionCredentials").count() == 1
        })
        .times(1)
        .returning(|_, upload| Ok(published("wb-3", &upload)));

    let mut resolver = MockConnectionResolver::new();
    resolver.expect_resolve().returning(|_| Ok(prod_target()));

    let session = signed_in(api).await;
    let report = session.publish(&doc, "Finance", &resolver).await.unwrap();
    assert_eq!(report.document.id, "wb-3");
}

use std::sync::Arc;

use actix_web::{error, get, middleware, post, web, App, HttpResponse, HttpServer, Responder};
use log::info;

use workshop_signup::admission::AdmissionService;
use workshop_signup::config::{Config, LedgerBackend, LockBackend, NotifierBackend};
use workshop_signup::error::SignupError;
use workshop_signup::ledger::{self, PgLedger, SignupLedger};
use workshop_signup::lock::{AdmissionLocks, KeyedLocks, LeaseLocks};
use workshop_signup::memory::MemoryLedger;
use workshop_signup::models::{self, SignupStatus};
use workshop_signup::queue::{AmqpNotifier, LogNotifier, Notifier};

#[derive(Debug, serde::Serialize)]
struct Res {
    message: String,
}

fn signup_error(e: SignupError) -> actix_web::Error {
    let message = match &e {
        SignupError::DuplicateSignup { .. } => "You're already registered for this workshop".to_string(),
        SignupError::WorkshopNotFound(_) => "Registration is unavailable for this workshop".to_string(),
        SignupError::SignupNotFound(_) => "Signup not found".to_string(),
        SignupError::AlreadyCancelled(_) => "Signup is already cancelled".to_string(),
        _ => "Please try again".to_string(),
    };
    let mut response = match &e {
        SignupError::DuplicateSignup { .. } | SignupError::AlreadyCancelled(_) => HttpResponse::Conflict(),
        SignupError::WorkshopNotFound(_) | SignupError::SignupNotFound(_) => HttpResponse::NotFound(),
        _ => HttpResponse::ServiceUnavailable(),
    };

    if e.is_transient() {
        log::error!("Signup request failed: {}", e);
    } else {
        info!("Signup request rejected: {}", e);
    }
    error::InternalError::from_response(e, response.json(Res { message })).into()
}

#[post("/signup")]
async fn request_signup(
    service: web::Data<AdmissionService>,
    form: web::Json<models::SignupRequest>
) -> actix_web::Result<impl Responder> {
    if form.user_id.is_empty() || form.user_id.len() > 255 {
        return Ok(HttpResponse::BadRequest().json(Res { message: "user_id must be between 1 and 255 characters".to_string() }));
    }

    let result = service
        .request_signup(&form.user_id, form.workshop_id, form.conference_id)
        .await
        .map_err(signup_error)?;

    Ok(HttpResponse::Created().json(models::SignupResponse {
        signup_id: result.signup.signup_id,
        status: result.status,
        message: match result.status {
            SignupStatus::Confirmed => "Signup confirmed".to_string(),
            _ => "Added to waitlist".to_string(),
        },
    }))
}

#[post("/cancel")]
async fn cancel_signup(
    service: web::Data<AdmissionService>,
    form: web::Json<models::CancelRequest>
) -> actix_web::Result<impl Responder> {
    let form = form.into_inner();
    service
        .cancel_signup(form.signup_id, form.reason)
        .await
        .map_err(signup_error)?;

    Ok(HttpResponse::Ok().json(models::ApiResponse {
        message: "Signup cancelled successfully".to_string(),
    }))
}

#[get("/signup/{signup_id}")]
async fn get_signup(
    service: web::Data<AdmissionService>,
    path: web::Path<i32>
) -> actix_web::Result<impl Responder> {
    let signup_id = path.into_inner();

    let signup = service
        .ledger()
        .get_signup(signup_id)
        .await
        .map_err(|e| signup_error(SignupError::LedgerRead(e)))?
        .ok_or_else(|| signup_error(SignupError::SignupNotFound(signup_id)))?;

    Ok(HttpResponse::Ok().json(signup))
}

#[get("/workshops/{workshop_id}/capacity")]
async fn get_capacity(
    service: web::Data<AdmissionService>,
    path: web::Path<i32>
) -> actix_web::Result<impl Responder> {
    let workshop_id = path.into_inner();

    let capacity = service.capacity(workshop_id).await.map_err(signup_error)?;
    if capacity.is_unknown_workshop() {
        return Err(signup_error(SignupError::WorkshopNotFound(workshop_id)));
    }

    Ok(HttpResponse::Ok().json(capacity))
}

#[post("/workshops/{workshop_id}/promote")]
async fn promote_waitlist(
    service: web::Data<AdmissionService>,
    path: web::Path<i32>
) -> actix_web::Result<impl Responder> {
    let workshop_id = path.into_inner();

    let message = match service.on_seat_freed(workshop_id).await.map_err(signup_error)? {
        Some(signup) => format!("Promoted signup {} from the waitlist", signup.signup_id),
        None => "Nobody was promoted".to_string(),
    };

    Ok(HttpResponse::Ok().json(models::ApiResponse { message }))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // initialize the pool once so it is shared by the ledger and the lease lock
    let pool = match &config.database_url {
        Some(url) => Some(ledger::initialize_db_pool(url, config.db_pool_timeout).map_err(std::io::Error::other)?),
        None => None,
    };

    let ledger: Arc<dyn SignupLedger> = match (config.ledger, &pool) {
        (LedgerBackend::Postgres, Some(pool)) => Arc::new(PgLedger::new(pool.clone())),
        _ => {
            info!("Using in-memory signup ledger; signups are lost on restart");
            Arc::new(MemoryLedger::new())
        }
    };

    let locks = match (config.lock, &pool) {
        (LockBackend::Lease, Some(pool)) => {
            info!("Admission locks: database leases (ttl {:?})", config.lease_ttl);
            AdmissionLocks::Lease(LeaseLocks::new(pool.clone(), config.lease_ttl, config.lock_acquire_timeout))
        }
        _ => {
            info!("Admission locks: in-process, single-instance deployment only");
            AdmissionLocks::Local(KeyedLocks::new(config.lock_acquire_timeout, config.lock_grace))
        }
    };

    let notifier: Arc<dyn Notifier> = match config.notifier {
        NotifierBackend::Amqp => {
            let mut notifier = AmqpNotifier::new(config.amqp.clone());
            notifier.initialize().await.map_err(std::io::Error::other)?;
            Arc::new(notifier)
        }
        NotifierBackend::Log => Arc::new(LogNotifier),
    };

    let service = web::Data::new(
        AdmissionService::new(ledger, Arc::new(locks), notifier).with_auto_promote(config.auto_promote),
    );

    info!("starting HTTP server at http://{}", config.bind_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .wrap(middleware::Logger::default())
            .app_data(web::JsonConfig::default().error_handler(|err, _req| {
                let detail = err.to_string();
                let response = match err {
                    error::JsonPayloadError::ContentType => {
                        HttpResponse::UnsupportedMediaType().body("Unsupported Media Type")
                    }
                    error::JsonPayloadError::Deserialize(ref err) => {
                        HttpResponse::BadRequest().json(Res { message: err.to_string() })
                    }

                    _ => HttpResponse::BadRequest().json(Res { message: detail }),
                };
                error::InternalError::from_response(err, response).into()
            }))
            .service(request_signup)
            .service(cancel_signup)
            .service(get_signup)
            .service(get_capacity)
            .service(promote_waitlist)
    })
    .bind(config.bind_addr.as_str())?
    .run()
    .await
}

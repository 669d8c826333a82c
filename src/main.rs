#[rocket::launch]
fn rocket() -> _ {
    let rocket = email_analytics::rocket();
    log::info!("starting email analytics server");
    rocket
}

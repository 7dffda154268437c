use loadfleet::error::AppResult;

fn main() -> AppResult<()> {
    loadfleet::entry::run()
}

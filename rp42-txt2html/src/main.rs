//! Turns a printed RP42 session transcript (stdin) into a standalone HTML
//! page (stdout), for publishing session logs on the project site.

use std::io::Read;

use clap::Parser;

#[derive(Parser)]
#[command(version, about = "Convert a printed RP42 session transcript to an HTML page")]
struct Opt {
    /// Page title, also used as the heading above the transcript.
    title: String,
}

fn main() -> std::io::Result<()> {
    let opt = Opt::parse();

    let mut transcript = String::new();
    std::io::stdin().read_to_string(&mut transcript)?;

    print!("{}", page(&opt.title, &transcript));
    Ok(())
}

/// Minimal escape for text dropped into markup. `&` first, so entities in
/// the transcript survive as literals.
fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn page(title: &str, transcript: &str) -> String {
    format!(
        "<html>\n\
         <head>\n  \
         <title>{title}</title>\n  \
         <link rel=\"icon\" type=\"image/png\" href=\"images/rp42-icon.png\">\n\
         </head>\n\
         <body>\n\
         <h3>{title}</h3>\n\
         <pre>{transcript}</pre>\n\
         <p>\n\
         <a href=\".\">Go to RP42 home page</a>\n\
         </body>\n\
         </html>\n",
        title = escape(title),
        transcript = escape(transcript),
    )
}

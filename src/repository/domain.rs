//! Typed upserts into the domain tables.
//!
//! Each chunk commits in one transaction; the conflict target is the
//! table's primary key, and a conflict updates every non-key column, so
//! replaying a chunk is a no-op row-count-wise.

use diesel::prelude::*;

use super::models::{
    AccommodationRow, AttractionRow, CulturalFacilityRow, CurrentWeatherRow, FestivalRow,
    ForecastRow, HistoricalDailyRow, LeisureSportsRow, RestaurantRow, ShoppingRow,
    TravelCourseRow,
};
use crate::pipeline::transform::{
    ContentType, CurrentWeatherRecord, ForecastRecord, HistoricalDailyRecord, TourismRecord,
};

macro_rules! tourism_upsert {
    ($fn_name:ident, $table:ident, $row:ident) => {
        pub fn $fn_name(
            conn: &mut SqliteConnection,
            records: &[TourismRecord],
            upsert: bool,
        ) -> QueryResult<usize> {
            use crate::schema::$table::dsl;
            conn.transaction(|conn| -> QueryResult<usize> {
                let mut written = 0;
                for record in records {
                    let row = $row::from(record);
                    written += if upsert {
                        diesel::insert_into(dsl::$table)
                            .values(row.clone())
                            .on_conflict(dsl::content_id)
                            .do_update()
                            .set(row)
                            .execute(conn)?
                    } else {
                        diesel::insert_into(dsl::$table).values(row).execute(conn)?
                    };
                }
                Ok(written)
            })
        }
    };
}

tourism_upsert!(upsert_attractions, tourist_attractions, AttractionRow);
tourism_upsert!(upsert_cultural_facilities, cultural_facilities, CulturalFacilityRow);
tourism_upsert!(upsert_festivals, festivals_events, FestivalRow);
tourism_upsert!(upsert_travel_courses, travel_courses, TravelCourseRow);
tourism_upsert!(upsert_leisure_sports, leisure_sports, LeisureSportsRow);
tourism_upsert!(upsert_accommodations, accommodations, AccommodationRow);
tourism_upsert!(upsert_shopping, shopping, ShoppingRow);
tourism_upsert!(upsert_restaurants, restaurants, RestaurantRow);

/// Route a tourism chunk to its content-type table.
pub fn upsert_tourism_chunk(
    conn: &mut SqliteConnection,
    content_type: ContentType,
    records: &[TourismRecord],
    upsert: bool,
) -> QueryResult<usize> {
    match content_type {
        ContentType::Attraction => upsert_attractions(conn, records, upsert),
        ContentType::CulturalFacility => upsert_cultural_facilities(conn, records, upsert),
        ContentType::Festival => upsert_festivals(conn, records, upsert),
        ContentType::TravelCourse => upsert_travel_courses(conn, records, upsert),
        ContentType::LeisureSports => upsert_leisure_sports(conn, records, upsert),
        ContentType::Accommodation => upsert_accommodations(conn, records, upsert),
        ContentType::Shopping => upsert_shopping(conn, records, upsert),
        ContentType::Restaurant => upsert_restaurants(conn, records, upsert),
    }
}

pub fn upsert_weather_current_chunk(
    conn: &mut SqliteConnection,
    records: &[CurrentWeatherRecord],
    upsert: bool,
) -> QueryResult<usize> {
    use crate::schema::weather_current::dsl;
    conn.transaction(|conn| -> QueryResult<usize> {
        let mut written = 0;
        for record in records {
            let row = CurrentWeatherRow::from(record);
            written += if upsert {
                diesel::insert_into(dsl::weather_current)
                    .values(row.clone())
                    .on_conflict((dsl::region_code, dsl::weather_date))
                    .do_update()
                    .set(row)
                    .execute(conn)?
            } else {
                diesel::insert_into(dsl::weather_current)
                    .values(row)
                    .execute(conn)?
            };
        }
        Ok(written)
    })
}

pub fn upsert_forecast_chunk(
    conn: &mut SqliteConnection,
    records: &[ForecastRecord],
    upsert: bool,
) -> QueryResult<usize> {
    use crate::schema::weather_forecasts::dsl;
    conn.transaction(|conn| -> QueryResult<usize> {
        let mut written = 0;
        for record in records {
            let row = ForecastRow::from(record);
            written += if upsert {
                diesel::insert_into(dsl::weather_forecasts)
                    .values(row.clone())
                    .on_conflict((dsl::region_code, dsl::forecast_date, dsl::forecast_time))
                    .do_update()
                    .set(row)
                    .execute(conn)?
            } else {
                diesel::insert_into(dsl::weather_forecasts)
                    .values(row)
                    .execute(conn)?
            };
        }
        Ok(written)
    })
}

pub fn upsert_historical_chunk(
    conn: &mut SqliteConnection,
    records: &[HistoricalDailyRecord],
    upsert: bool,
) -> QueryResult<usize> {
    use crate::schema::historical_weather_daily::dsl;
    conn.transaction(|conn| -> QueryResult<usize> {
        let mut written = 0;
        for record in records {
            let row = HistoricalDailyRow::from(record);
            written += if upsert {
                diesel::insert_into(dsl::historical_weather_daily)
                    .values(row.clone())
                    .on_conflict((dsl::region_code, dsl::weather_date))
                    .do_update()
                    .set(row)
                    .execute(conn)?
            } else {
                diesel::insert_into(dsl::historical_weather_daily)
                    .values(row)
                    .execute(conn)?
            };
        }
        Ok(written)
    })
}
